//! Clusterloop core
//!
//! Cluster-scoped keys and resource clients for API servers that partition
//! resources into logical clusters (kcp workspaces). Every read and write names
//! its logical cluster explicitly.

pub mod client;
pub mod cluster;
pub mod kcp;
pub mod memory;
pub mod patch;
pub mod resource;
pub mod scheme;
pub mod watch;

pub use client::{ClientError, ListFilter, Listing, ResourceClient, WatchStream};
pub use cluster::{cluster_of, set_cluster, ClusterKey, LogicalCluster, CLUSTER_ANNOTATION};
pub use kcp::KcpClient;
pub use memory::MemoryClient;
pub use patch::MergePatch;
pub use resource::ClusterResource;
pub use scheme::{KindInfo, Scheme};
pub use watch::{ResumableWatch, WatchError, WatchEvent, WatchStatus};
