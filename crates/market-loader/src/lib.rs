pub mod buyer;
pub mod loader;
pub mod validate;

pub use buyer::BuyerContext;
pub use loader::{DataLoader, SellerResource, SellersForecasts};
pub use validate::validate_forecasters;
