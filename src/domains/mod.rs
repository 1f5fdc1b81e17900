pub mod credits;
pub mod ledger;
pub mod promo;
pub mod uploads;
