pub mod admission;
pub mod config;
pub mod digest;
pub mod fingerprint;
pub mod form;
pub mod intake;
pub mod landing;
pub mod ledger;
pub mod notify;
pub mod page;
pub mod reconcile;
pub mod sanitize;
pub mod util;
