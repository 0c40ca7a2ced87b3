pub mod decision;
pub mod forecast;
pub mod inverter;
pub mod price;
pub mod session;
pub mod snapshot;

pub use decision::*;
pub use forecast::*;
pub use inverter::*;
pub use price::*;
pub use session::*;
pub use snapshot::*;
