//! Delivery workers.
//!
//! A fixed pool of workers reserves jobs from the durable queue and runs the
//! delivery procedure for each: resolve the address, unmask and render the
//! content, send it over SMTP, then record the outcome and resolve the job
//! (delete on success or permanent failure, back off and retry otherwise).

pub mod gauge;
pub mod mailer;
pub mod pool;
pub mod templates;
pub mod worker;

pub use gauge::QueueGauge;
pub use mailer::{Mailer, OutboundMail, SendError, SmtpConfig, SmtpMailer};
pub use pool::WorkerPool;
pub use templates::{RenderContext, RenderError, RenderedMessage, Template, TemplateRenderer, Templates};
pub use worker::{DeliveryServices, DeliveryWorker, Resolution, StorageRetry, WorkerError};
