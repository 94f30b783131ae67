pub mod user;
pub mod user_preference;

pub use user::Entity as User;
pub use user_preference::Entity as UserPreference;
