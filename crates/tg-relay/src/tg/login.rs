use super::source::{connect_client, save_session, TgClientError};
use crate::prelude::*;
use crate::{err, err_ctx, tg, Result};
use grammers_client::SignInError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Interactively signs in to the user account and saves the session file
/// that is later used to read the source chats
pub(crate) async fn login(cfg: &tg::ClientConfig) -> Result {
    let client = connect_client(cfg).await?;

    let authorized = client
        .is_authorized()
        .await
        .map_err(err_ctx!(TgClientError::Invocation {
            request: "is_authorized"
        }))?;

    if authorized {
        info!("The session is already authorized, nothing to do");
        return Ok(());
    }

    let phone = prompt("Enter the phone number (international format): ").await?;

    let token = client
        .request_login_code(&phone)
        .await
        .map_err(err_ctx!(TgClientError::RequestLoginCode))?;

    let code = prompt("Enter the code you received: ").await?;

    let user = match client.sign_in(&token, &code).await {
        Ok(user) => user,
        Err(SignInError::PasswordRequired(password_token)) => {
            let hint = password_token.hint().unwrap_or_default().to_owned();
            let password = prompt(&format!("Enter the 2FA password (hint: {hint}): ")).await?;

            client
                .check_password(password_token, password.as_bytes())
                .await
                .map_err(err_ctx!(TgClientError::SignIn))?
        }
        Err(err) => return Err(err!(TgClientError::SignIn { source: err })),
    };

    info!(user = %user.full_name(), "Signed in");

    save_session(&client, &cfg.session_file)?;

    info!(
        session_file = %cfg.session_file.display(),
        "The session is saved, now the `run` command can be used"
    );

    Ok(())
}

async fn prompt(message: &str) -> Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;

    Ok(line.trim().to_owned())
}
