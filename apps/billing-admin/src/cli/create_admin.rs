use billing_core::{
    CoreError, UserRepository,
    domain::user::{RegisterUser, Role, User, hash_password},
};
use chrono::Utc;
use clap::Args;
use tracing::info;

#[derive(Debug, Args)]
pub(crate) struct CreateAdminArgs {
    #[arg(long)]
    username: String,

    /// Admin password
    #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
    password: String,
}

pub(crate) async fn run<S>(store: &S, args: CreateAdminArgs) -> Result<(), CoreError>
where
    S: UserRepository + ?Sized,
{
    let user = create_admin(store, &args.username, &args.password).await?;
    println!("admin_id: {}", user.id);
    println!("username: {}", user.username);
    Ok(())
}

async fn create_admin<S>(store: &S, username: &str, password: &str) -> Result<User, CoreError>
where
    S: UserRepository + ?Sized,
{
    let command = RegisterUser {
        username: username.to_string(),
        password: password.to_string(),
        role: Role::Admin,
        flat_id: None,
    };
    let password_hash = hash_password(&command.password)?;
    let user = User::register(&command, password_hash, Utc::now())?;
    let user = store.create_user(user).await?;
    info!(user_id = %user.id, username = %user.username, "Admin account created");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::{adapters::InMemoryStore, domain::user::verify_password};

    #[tokio::test]
    async fn creates_admin_with_hashed_password() {
        let store = InMemoryStore::new();
        let user = create_admin(&store, "root", "hunter2").await.unwrap();

        assert_eq!(user.role, Role::Admin);
        assert_ne!(user.password_hash, "hunter2");
        assert!(verify_password("hunter2", &user.password_hash).is_ok());
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = InMemoryStore::new();
        create_admin(&store, "root", "hunter2").await.unwrap();
        let result = create_admin(&store, "root", "other").await;
        assert!(matches!(result, Err(CoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn empty_password_is_rejected() {
        let store = InMemoryStore::new();
        let result = create_admin(&store, "root", "  ").await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }
}
