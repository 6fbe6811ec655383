//! # rgbd
//!
//! A Linux daemon and library that drives RGB lighting hardware through a
//! common device/LED model.
//!
//! ## Features
//!
//! - **Update queues**: per-LED color writes from any thread are coalesced
//!   into one batch per device, keeping only the newest color per LED
//! - **Rate-limited triggers**: hardware is written on demand, never faster
//!   than a configurable floor, from dedicated worker threads
//! - **Providers**: Thermaltake Riing Quad (HID), E1.31/sACN over UDP and
//!   virtual debug devices
//! - **Error routing**: hardware failures never reach the writing thread;
//!   they are published on the [`EventBus`](event::EventBus)
//! - **Hot Reload**: color assignments change without restart
//!
//! ## Architecture
//!
//! - [`UpdateQueue`](update::UpdateQueue) - coalescing buffer bound to one device
//! - [`UpdateTrigger`](update::UpdateTrigger) - decides when queues flush
//! - [`DeviceProvider`](provider::DeviceProvider) - owns devices, queues and triggers of one back end
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - daemon lifecycle
//!
//! ## Example
//!
//! ```no_run
//! use rgbd::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod cli;
pub mod color;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod drivers;
pub mod event;
pub mod id_registry;
pub mod led;
pub mod provider;
pub mod services;
pub mod task_manager;
pub mod update;
