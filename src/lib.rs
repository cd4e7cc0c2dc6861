//! Coordinated parallel tree replication over rsync.
//!
//! `zkmirror` replicates one directory tree to many destination hosts by
//! splitting it into depth-bounded work units and spreading the transfers
//! over a fleet of cooperating processes. A ZooKeeper ensemble carries all
//! shared state: the leader lease, the work and bookkeeping queues, live
//! membership, destination health and the aggregated transfer statistics.
//!
//! # Roles
//!
//! Every process is started with the same session name and one of two roles:
//!
//! - **source** (`--source`): races for the session lease. The winner
//!   partitions the tree, seeds the path queue and manages the run; losers
//!   claim units off the queue and push them to destination daemons with
//!   rsync.
//! - **destination** (`--destination`): reserves a port, runs an rsync
//!   daemon over the base path and advertises its endpoint for sources to
//!   claim.
//!
//! The run ends when the path queue drains: the leader flips the shared
//! watch node to "stop", waits for everyone to disconnect and tears the
//! session state down.

pub mod config;
pub mod coord;
pub mod destination;
pub mod deststate;
pub mod identity;
pub mod rsync;
pub mod source;
pub mod stats;
pub mod walk;
