//! # Gateway Engine
//!
//! Request-orchestration and upstream-dispatch core of the stateless
//! verifying RPC gateway: classified failover across execution, beacon, and
//! REST upstream pools with adaptive concurrency, a coalescing TTL cache,
//! a resumable proof-program runner, the beacon event consumer, and the
//! local period store.

pub mod cache;
pub mod classify;
pub mod context;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod head_poll;
pub mod period_store;
pub mod registry;
pub mod request;
pub mod runner;
pub mod select;
pub mod sse;
pub mod sync;

pub use cache::{CacheConfig, CoalescingCache, Lookup};
pub use classify::{classify, error_indicates_not_found, ResponseClass};
pub use context::{CancelToken, ProofContext};
pub use self::core::Engine;
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::GatewayError;
pub use events::{BeaconEventConsumer, ConsumerState, EventsConfig, HeadSnapshot};
pub use head_poll::HeadPoller;
pub use period_store::{PeriodStore, PeriodStoreConfig};
pub use registry::{RegistryConfig, Upstream, UpstreamKind, UpstreamRegistry};
pub use request::{flags, BodyEncoding, DataRequest, Fingerprint, HttpVerb, RequestKind};
pub use runner::{ProofProgram, ProofRunner, RunnerConfig, StepOutcome};
pub use sse::{SseEvent, SseParser};
pub use sync::{StructuralVerifier, SyncTransitionRunner, SyncVerifier, VerifiedUpdate};
