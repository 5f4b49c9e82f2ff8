pub mod cursor;
pub mod types;

pub use cursor::{format_micros, now_micros, parse_cursor, parse_timestamp};
pub use types::{
    ErrorBody, ErrorCode, ItemAck, ItemConflict, ItemError, ItemResult, Operation, PullItem,
    PullMessage, PullResponse, PushItem, PushMessage, PushResponse,
};
