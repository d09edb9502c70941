use std::sync::Arc;

mod http;
mod service;
mod wire;

pub use http::{HTTP_SERVICE_ID, HttpAssistant};
pub use service::{
    AssistantService, BoxFuture, DEFAULT_CONNECT_TIMEOUT, DEFAULT_ENDPOINT,
    DEFAULT_REQUEST_TIMEOUT, ExchangeRequest, FragmentEvent, FragmentStream, FragmentStreamHandle,
    HealthStatus, ServiceConfig, ServiceError, ServiceResult, ServiceWorker, make_fragment_stream,
};
pub use wire::UNPROCESSED_REPLY;

pub fn create_service(config: ServiceConfig) -> ServiceResult<Arc<dyn AssistantService>> {
    let service = HttpAssistant::new(config)?;
    tracing::info!(
        service = HTTP_SERVICE_ID,
        endpoint = service.endpoint(),
        "assistant service ready"
    );
    Ok(Arc::new(service))
}
