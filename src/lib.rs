// NEOX -- CLOSED-LOOP CPU FREQUENCY GOVERNOR
// LIBRARY: HOST-INDEPENDENT CONTROL LOOP + LINUX BACKENDS

pub mod engine;
pub mod error;
pub mod event;
pub mod governor;
pub mod host;
pub mod sampler;
pub mod surface;
pub mod sysfs;
pub mod timer;
pub mod tuning;
