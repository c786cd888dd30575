pub mod ca;
pub mod store;

pub use ca::CertificateAuthority;
pub use store::{CertStore, CertStoreStats};
