use clap::Subcommand;
use std::path::PathBuf;

use crate::api::ApiClient;
use crate::config::GatewayConfig;
use crate::session::SessionPhase;

#[derive(Subcommand)]
pub enum Command {
    /// Run the session gateway (default)
    Serve,
    /// Log in and store the session for later commands
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "ENVOICE_PASSWORD")]
        password: String,
    },
    /// Create an account; a confirmation email follows
    Signup {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "ENVOICE_PASSWORD")]
        password: String,
    },
    /// Send the confirmation email again
    ResendConfirmation {
        #[arg(long)]
        email: String,
    },
    /// Set a new password with the token from a reset email
    ResetPassword {
        #[arg(long)]
        token: String,
        #[arg(long, env = "ENVOICE_NEW_PASSWORD")]
        new_password: String,
        /// Defaults to the new password
        #[arg(long)]
        confirm_password: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show who is logged in
    Status,
    /// GET an API path and print the JSON response
    Get {
        /// e.g. /invoices or /clients
        path: String,
    },
    /// Save the raw response of an API path to a file
    Download {
        /// e.g. /invoices/42/pdf
        path: String,
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Run the gateway, or one client command against the stored session.
pub async fn run(command: Command, config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Serve = command {
        return crate::serve(config).await;
    }

    let http_client = reqwest::Client::new();
    let session = crate::build_session(&config, &http_client);
    let api = ApiClient::new(http_client, &config.backend.url, session);

    // Commands that replace the session must not wait on a refresh of the old one
    if !matches!(command, Command::Login { .. } | Command::Logout) {
        let phase = api.session().restore().await;
        tracing::debug!("Session restored: {}", phase);
    }

    match command {
        Command::Serve => {}
        Command::Login { email, password } => {
            let user = api.login(&email, &password).await?;
            match user {
                Some(user) => println!("Logged in as {}", user.display_name()),
                None => println!("Logged in as {}", email),
            }
        }
        Command::Signup {
            username,
            email,
            password,
        } => {
            api.register(&username, &email, &password).await?;
            println!("Account created. Check {} for a confirmation link.", email);
        }
        Command::ResendConfirmation { email } => {
            api.resend_confirmation(&email).await?;
            println!("Confirmation email sent to {}", email);
        }
        Command::ResetPassword {
            token,
            new_password,
            confirm_password,
        } => {
            let confirm = confirm_password.as_deref().unwrap_or(&new_password);
            api.reset_password(&token, &new_password, confirm).await?;
            println!("Password updated. You can log in now.");
        }
        Command::Logout => {
            api.logout();
            println!("Logged out");
        }
        Command::Status => {
            let session = api.session().snapshot();
            match (session.phase(), &session.user) {
                (SessionPhase::Authenticated, Some(user)) => {
                    println!("Logged in as {}", user.display_name())
                }
                (SessionPhase::Authenticated, None) => println!("Logged in"),
                _ => println!("Not logged in"),
            }
        }
        Command::Get { path } => {
            let body = api.get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Download { path, output } => {
            let bytes = api.download(&path).await?;
            std::fs::write(&output, &bytes)?;
            println!("Saved {} bytes to {}", bytes.len(), output.display());
        }
    }

    Ok(())
}
