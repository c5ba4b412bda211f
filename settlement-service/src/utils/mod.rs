pub mod phone;

pub use phone::normalize_msisdn;
