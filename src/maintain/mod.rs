//! Background tasks that keep the mesh alive.

pub(crate) mod heartbeat;
pub(crate) mod reconnect;
pub(crate) mod route_refresh;
