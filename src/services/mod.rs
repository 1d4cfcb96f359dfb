pub mod healthcheck;
pub mod mail_worker;
pub mod public_http_server;
