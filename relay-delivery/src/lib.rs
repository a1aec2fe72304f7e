pub mod vapid;
pub mod webpush;

pub use vapid::{endpoint_origin, VapidClaims, VapidError, VapidSigner};
pub use webpush::{PushMessage, WebPushDispatcher};
