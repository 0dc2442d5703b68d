pub mod call;

pub use call::{CallDirection, CallId, CallKind, EndReason, TrackKind, UserId, UserProfile};
