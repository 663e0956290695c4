//! HTTP fetch collaborator for the pricewatch engine.
//!
//! The engine only needs a status code and a body, so this crate
//! holds a [`Fetch`] trait, a reqwest-backed [`HttpClient`]
//! with browser-like header rotation, and URL template helpers.

mod client;
mod errors;
pub mod template;
pub mod types;
mod user_agent;

pub use self::client::{Fetch, HttpClient};
pub use self::errors::Error;
pub use self::types::{FetchRequest, HttpResponse, StatusClass};
pub use self::user_agent::{get_accept_language, get_user_agent, rotate_headers};
