pub mod context;
pub mod jwt;

// Re-export public items
pub use context::AuthContext;
pub use jwt::{JwtVerifier, TokenVerifier};
