use dialoguer::{Confirm, Input, Password, Select};
use url::Url;

use crate::transport::Credentials;

/// Confirmation dialogs shown when the user asks to stop a download.
pub trait CancelPrompt: Send + Sync {
    /// Optional update: "cancel the download?" yes/no.
    fn confirm_abort(&self) -> bool;

    /// Mandatory update: "continue" or "quit the application".
    fn confirm_terminate(&self) -> bool;
}

/// Supplies credentials when the server demands authentication.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, url: &Url, realm: Option<&str>) -> Option<Credentials>;
}

/// Accepts every cancellation and never has credentials.
pub struct AutoConfirm;

impl CancelPrompt for AutoConfirm {
    fn confirm_abort(&self) -> bool {
        true
    }

    fn confirm_terminate(&self) -> bool {
        true
    }
}

impl CredentialProvider for AutoConfirm {
    fn credentials(&self, _url: &Url, _realm: Option<&str>) -> Option<Credentials> {
        None
    }
}

pub struct TerminalPrompt;

impl CancelPrompt for TerminalPrompt {
    fn confirm_abort(&self) -> bool {
        Confirm::new()
            .with_prompt("Are you sure you want to cancel the download?")
            .default(false)
            .interact()
            // No terminal to ask on: the interrupt is the answer.
            .unwrap_or(true)
    }

    fn confirm_terminate(&self) -> bool {
        let choice = Select::new()
            .with_prompt(
                "Are you sure you want to cancel the download? This is a mandatory update, \
                 exiting now will close the application",
            )
            .items(&["Continue", "Quit"])
            .default(0)
            .interact();

        match choice {
            Ok(index) => index == 1,
            Err(_) => true,
        }
    }
}

impl CredentialProvider for TerminalPrompt {
    fn credentials(&self, url: &Url, realm: Option<&str>) -> Option<Credentials> {
        let host = url.host_str().unwrap_or("server");
        match realm {
            Some(realm) => eprintln!("{} requires authentication ({})", host, realm),
            None => eprintln!("{} requires authentication", host),
        }

        let username: String = Input::new()
            .with_prompt("Username")
            .allow_empty(true)
            .interact_text()
            .ok()?;
        if username.trim().is_empty() {
            return None;
        }

        let password = Password::new().with_prompt("Password").interact().ok()?;

        Some(Credentials {
            username: username.trim().to_string(),
            password,
        })
    }
}
