//! JoyRPC runtime core: the object graph that binds a caller's local proxy
//! (a [`invoker::refer::Refer`]) or a server's published implementation (an
//! [`invoker::exporter::Exporter`]) to the network, keeps both ends alive
//! through registry changes and connection failures, and preserves
//! request/response ordering and at-most-one delivery per call.
//!
//! Module map mirrors the runtime's component boundaries rather than a
//! generic layering — each module owns one piece named in the spec's
//! component table: wire contract (`url`, `request`, `codec`), connection
//! lifecycle (`channel`, `channel_manager`, `heartbeat`, `transport`),
//! cluster membership (`node`, `registry`, `cluster`), call placement
//! (`loadbalance`, `route`, `filter`), dispatch metadata (`descriptor`,
//! `health`), call bookkeeping (`call_future`, `timing_wheel`), the bound
//! call objects (`invoker`), process-wide extension points (`plugin`,
//! `shutdown`), and the error taxonomy (`error`).

pub mod call_future;
pub mod channel;
pub mod channel_manager;
pub mod cluster;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod health;
pub mod heartbeat;
pub mod invoker;
pub mod loadbalance;
pub mod node;
pub mod plugin;
pub mod registry;
pub mod request;
pub mod route;
pub mod shutdown;
pub mod timing_wheel;
pub mod transport;
pub mod url;

pub use error::{ErrorCode, Result, RpcError};
pub use invoker::exporter::{Exporter, ExporterConfig, RejectionPolicy, ServiceImpl};
pub use invoker::refer::{Refer, ReferConfig};
pub use invoker::InvokerState;
pub use request::{Outcome, Request, Response};
pub use url::Url;
