//! Wire-level envelopes carried on capability topics.

pub mod envelope;
pub mod work_item;

pub use envelope::{
    Payload, Request, Response, ResponseStatus, SerializableException, UNBOUND_REQUEST_INDEX,
    correlation_key_schema, request_envelope_schema, response_envelope_schema,
};
pub use work_item::{WorkItem, WorkItems};
