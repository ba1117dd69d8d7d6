pub mod callback;
pub mod command;

use crate::models::user::UserProfile;
use teloxide::types::User;

pub(crate) fn profile_of(user: &User) -> UserProfile {
    UserProfile {
        id: user.id.0 as i64,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
    }
}
