//! Debounced filesystem-change watching.
//!
//! [`PathWatcher`] keeps a set of tracked paths mirrored against OS change
//! notifications, with a periodic reconciliation sweep as the correctness
//! backstop, and emits [`ChangeEvent`]s on an output queue.
//! [`CoalescingWatcher`] wraps it to merge bursts into one event per
//! interval.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use vigil_fswatch::{PathWatcher, WatcherConfig};
//!
//! # async fn demo() -> Result<(), vigil_fswatch::WatchError> {
//! let watcher = PathWatcher::new(&["/etc/app/config.toml"], WatcherConfig::default())?;
//! let mut events = watcher.events().expect("events already taken");
//! watcher.start(CancellationToken::new()).await;
//! while let Some(event) = events.recv().await {
//!     for path in &event.paths {
//!         println!("changed: {}", path.display());
//!     }
//! }
//! watcher.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod coalesce;
pub mod error;
pub mod event;
pub mod watcher;

pub use coalesce::CoalescingWatcher;
pub use error::{Result, WatchError};
pub use event::ChangeEvent;
pub use watcher::{PathWatcher, WatcherConfig, DEFAULT_RECONCILE_INTERVAL};
