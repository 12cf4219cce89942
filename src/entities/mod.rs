//! sea-orm entities for the delivery schema.
//!
//! `orders.subtotal/tax/total` and `restaurants.rating_avg` are derived
//! columns; they are written only by the maintainers in `crate::services`.

pub mod address;
pub mod customer;
pub mod menu;
pub mod menu_item;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod restaurant;
pub mod review;

pub use order::OrderStatus;
pub use payment::PaymentStatus;
