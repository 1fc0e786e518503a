pub mod api;
pub mod middleware;
pub mod models;
pub mod refresh_store;
pub mod reset;
pub mod tokens;
pub mod user_store;

pub use api::{AuthConfig, AuthState};
pub use middleware::auth_gate;
pub use models::{Claims, User};
pub use refresh_store::{MemoryRefreshStore, RefreshStore, SqliteRefreshStore};
pub use reset::{LogMailer, MemoryResetStore, ResetMailer, ResetTokenStore, SqliteResetStore};
pub use tokens::{RefreshTokenMode, TokenService};
pub use user_store::{MemoryUserStore, SqliteUserStore, UserStore};
