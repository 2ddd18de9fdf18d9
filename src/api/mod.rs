//! REST API module
//!
//! HTTP surface of a node: the operator API and the peer-facing routes used
//! by the REST and WebSocket transports.
//!
//! # Endpoints
//!
//! ## Operator
//! - `GET /health` - Liveness check
//! - `GET /api/status` - Node overview (advert, discovery mode, peer counts, queue)
//! - `GET /api/peers` - Known peers with health and circuit state
//! - `POST /api/transactions` - Submit a hex payload for distribution
//! - `GET /api/queue` - Offline queue contents
//! - `GET /api/queue/dead-letters` - Items that ran out of retries
//!
//! ## Peer protocol
//! - `POST /p2p/register`, `GET /p2p/peers`, `GET /p2p/ping`, `POST /p2p/notify`
//! - `GET /p2p/transactions/{hash}` and `GET /p2p/transactions/{hash}/stream`
//! - `GET /p2p/ws` - Multiplexed frame stream

pub mod handlers;
pub mod routes;
pub mod websocket;

pub use handlers::{ApiState, NodeStatus};
pub use routes::create_router;
