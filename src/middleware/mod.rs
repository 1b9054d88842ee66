//! HTTP middleware and extractors

pub mod caller;
pub mod request_id;

pub use caller::{ACTOR_ID_HEADER, ORG_ID_HEADER};
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
