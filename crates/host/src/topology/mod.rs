//! Device tree
//!
//! The tree is rooted at a synthetic [`RootHub`]. Nodes are owned by the
//! [`TopologySynchronizer`]'s device map; hub ports refer to their occupants
//! by [`DeviceId`](crate::DeviceId) only.

pub mod node;
pub mod port;
pub mod root_hub;
pub mod synchronizer;

pub use node::{DeviceNode, NodeKind};
pub use port::{HubRef, Port, PortRef, PortSet};
pub use root_hub::RootHub;
pub use synchronizer::{ScanReport, TopologySynchronizer};
