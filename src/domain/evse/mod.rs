pub mod hooks;
pub mod model;

pub use hooks::{EdgeHooks, FiredHooks, HookToken, OneShotHook, RepeatingHook};
pub use model::{Edge, EdgeEvent, EvseFlag, EvseState, MeterReport, StatusReport};
