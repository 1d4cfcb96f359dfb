use {
    crate::{
        blob::S3BlobStore,
        config::Configuration,
        mail::{MailDispatcher, MailOptions},
        mailer::SesMailer,
        metrics::Metrics,
        model::helpers::PostgresStore,
        phones::{
            vendor::{HttpSmsClient, NoopSmsClient, SmsClient},
            PhoneOptions, PhoneService,
        },
        queue::SqsQueue,
        services::mail_worker::{MailWorker, StopReason, WorkerOptions},
        sns::verifier::SignatureVerifier,
        state::AppState,
    },
    aws_config::BehaviorVersion,
    sqlx::{postgres::PgPoolOptions, PgPool},
    std::sync::Arc,
    tokio::{select, sync::broadcast},
    tracing::info,
};

pub mod blob;
pub mod config;
pub mod error;
pub mod mail;
pub mod mailer;
pub mod metrics;
pub mod model;
pub mod phones;
pub mod queue;
pub mod services;
pub mod sns;
pub mod state;

pub use error::{RelayServerError, Result};

async fn postgres_pool(config: &Configuration) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres_max_connections)
        .connect(&config.postgres_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

async fn aws_sdk_config(config: &Configuration) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));
    if let Some(profile) = &config.outbound_mailer_credentials {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

fn sms_client(config: &Configuration) -> Arc<dyn SmsClient> {
    match (&config.phone_provider_url, &config.phone_provider_auth_token) {
        (Some(endpoint), Some(auth_token)) => Arc::new(HttpSmsClient::new(
            reqwest::Client::new(),
            endpoint.clone(),
            auth_token.clone(),
        )),
        _ => Arc::new(NoopSmsClient),
    }
}

/// Serves the telephony webhooks and the phone verification API until the
/// shutdown channel fires.
pub async fn bootstrap(mut shutdown: broadcast::Receiver<()>, config: Configuration) -> Result<()> {
    let postgres = postgres_pool(&config).await?;
    let metrics = Some(Metrics::new()?);

    let store = Arc::new(PostgresStore::new(postgres, metrics.clone()));
    let phones = PhoneService::new(
        store,
        sms_client(&config),
        PhoneOptions {
            max_verify_age: config.max_verify_age(),
            allowed_countries: config.phone_allowed_countries.clone(),
        },
    );

    let bind_ip = config.bind_ip;
    let port = config.port;
    let state = Arc::new(AppState::new(config, metrics, phones));

    select! {
        result = services::public_http_server::start(bind_ip, port, state) => result?,
        _ = shutdown.recv() => info!("Shutdown signal received, stopping server"),
    }

    Ok(())
}

/// Builds the queue worker with its collaborators and runs it to
/// completion.
pub async fn run_worker(
    config: Configuration,
    options: WorkerOptions,
    shutdown: broadcast::Receiver<()>,
) -> Result<StopReason> {
    let postgres = postgres_pool(&config).await?;
    let metrics = Some(Metrics::new()?);
    let aws = aws_sdk_config(&config).await;

    let queue = Arc::new(SqsQueue::new(
        aws_sdk_sqs::Client::new(&aws),
        config.queue_url.clone(),
    ));
    let blobs = Arc::new(S3BlobStore::new(aws_sdk_s3::Client::new(&aws)));
    let mailer = Arc::new(SesMailer::new(aws_sdk_sesv2::Client::new(&aws)));
    let store = Arc::new(PostgresStore::new(postgres, metrics.clone()));

    let http_client = reqwest::Client::new();
    let verifier = Arc::new(SignatureVerifier::new(
        http_client.clone(),
        config.cert_url_host_allowlist.clone(),
        metrics.clone(),
    ));
    let dispatcher = MailDispatcher::new(
        store,
        blobs,
        mailer,
        MailOptions {
            relay_domain: config.relay_domain.clone(),
            relay_from_address: config.relay_from_address.clone(),
            blocked_senders: config.blocked_senders.clone(),
        },
        metrics.clone(),
    );

    let worker = MailWorker::new(
        queue,
        dispatcher,
        verifier,
        http_client,
        config.allowed_topic.clone(),
        options,
        metrics,
        shutdown,
    );
    Ok(worker.run().await?)
}
