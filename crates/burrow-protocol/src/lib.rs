//! Wire contract between the Burrow server and its tunnel clients.
//!
//! Both directions of traffic for a client travel over a single bus topic:
//!
//! ```text
//! server --(request dump)------------> clients/<id> --> tunnel client
//! server <--("X-" + raw response)----- clients/<id> <-- tunnel client
//! ```
//!
//! Requests are unprefixed HTTP/1.x dumps; replies carry the [`REPLY_SIGIL`]
//! so that a request echoed back by the bus is never mistaken for a reply.

mod dump;
mod head;
mod reply;
mod topic;

pub use dump::{canonical_header_name, dump_request_id, encode, EncodeError};
pub use reply::{decode, encode_reply, no_reply_response, reply_request_id, REPLY_SIGIL};
pub use topic::{topic, ClientId, RequestId, REQUEST_ID_HEADER, TOPIC_NAMESPACE};
