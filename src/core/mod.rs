pub mod error_response;
pub mod forwarder;
pub mod observer;
pub mod request_id;

pub use error_response::{error_response, error_response_for};
pub use forwarder::Forwarder;
pub use observer::{ObservedBody, ResponseObserver};
pub use request_id::RequestId;
