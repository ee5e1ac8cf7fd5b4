//! Worker process of the flashgrab coupon pipeline.
//!
//! One worker runs the whole pipeline: the decision gateway and its
//! publisher, the persister consuming the event channel, the periodic
//! reconciler, and the query and admin services behind [`CouponApi`].
//! Several workers can share the same backends; persisters split the
//! topic through their consumer group.
//!
//! ```no_run
//! use flashgrab_server::{App, Config};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! let app = App::build(&config).await?;
//! let reply = app.api().grab("alice", "coupon-101").await?;
//! println!("{}", reply.outcome);
//! app.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```
//!
//! [`CouponApi`]: flashgrab_runtime::CouponApi

pub mod app;
pub mod config;

pub use app::{App, AppError, Backends};
pub use config::Config;
