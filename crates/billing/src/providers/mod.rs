//! Concrete payment provider implementations

pub mod paddle;
pub mod stripe;

pub use self::paddle::PaddleProvider;
pub use self::stripe::StripeProvider;
