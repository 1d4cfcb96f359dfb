use {
    crate::{config::Configuration, metrics::Metrics, phones::PhoneService},
};

pub struct AppState {
    pub config: Configuration,
    pub metrics: Option<Metrics>,
    pub phones: PhoneService,
}

impl AppState {
    pub fn new(config: Configuration, metrics: Option<Metrics>, phones: PhoneService) -> Self {
        Self {
            config,
            metrics,
            phones,
        }
    }
}
