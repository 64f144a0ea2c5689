//! flotilla-client: typed client for the Flotilla controller API.
//!
//! ```no_run
//! # async fn demo() -> flotilla_client::ClientResult<()> {
//! use flotilla_client::Client;
//!
//! let client = Client::new("http://127.0.0.1:1200")?;
//! for app in client.list_apps().await? {
//!     println!("{} {}", app.id, app.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod events;

pub use client::{AttachStream, Client, DEFAULT_URL};
pub use error::{ClientError, ClientResult};
pub use events::{SseCodec, SseEvent};
