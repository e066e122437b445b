//! Interactive login path: the single-flight cookie broker and the
//! login-code flow that replays reese cookies over HTTP.

mod cookie;
mod login;

pub use cookie::CookieBroker;
pub use login::{LoginError, LoginFlow};
