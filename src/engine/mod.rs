pub mod charging;
pub mod selling;

pub use charging::{ChargeContext, ChargingEngine, ChargingState};
pub use selling::{SellContext, SellingEngine, SellingState};
