pub mod change_password;
pub mod login;
pub mod manage_flats;
pub mod register_user;
pub mod review_reading;
pub mod submit_reading;
pub mod update_settings;

pub use change_password::ChangePasswordHandler;
pub use login::{LoginHandler, LoginUser};
pub use manage_flats::{CreateFlatHandler, UpdateFlat, UpdateFlatHandler};
pub use register_user::{RegisterUserHandler, UserResponse};
pub use review_reading::{ApproveReadingHandler, RejectReadingHandler, ReopenReadingHandler};
pub use submit_reading::SubmitReadingHandler;
pub use update_settings::UpdateSettingsHandler;
