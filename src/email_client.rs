use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use std::env;

/// Fire-and-forget SMTP alerting. Fully configured from the environment;
/// when the SMTP settings are absent the client silently does nothing so
/// tests and local runs never touch the network.
pub struct EmailClient {
    settings: Option<SmtpSettings>,
}

struct SmtpSettings {
    host: String,
    username: String,
    password: String,
    from: String,
    to: String,
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailClient {
    pub fn new() -> Self {
        let settings = match (
            env::var("SMTP_HOST"),
            env::var("SMTP_USERNAME"),
            env::var("SMTP_PASSWORD"),
            env::var("ALERT_EMAIL_FROM"),
            env::var("ALERT_EMAIL_TO"),
        ) {
            (Ok(host), Ok(username), Ok(password), Ok(from), Ok(to)) => Some(SmtpSettings {
                host,
                username,
                password,
                from,
                to,
            }),
            _ => None,
        };
        Self { settings }
    }

    pub fn send(&self, subject: &str, body: &str) {
        let Some(settings) = &self.settings else {
            log::debug!("[EMAIL] SMTP not configured, dropping '{}'", subject);
            return;
        };

        let message = match Message::builder()
            .from(match settings.from.parse() {
                Ok(mbox) => mbox,
                Err(err) => {
                    log::warn!("[EMAIL] invalid ALERT_EMAIL_FROM: {:?}", err);
                    return;
                }
            })
            .to(match settings.to.parse() {
                Ok(mbox) => mbox,
                Err(err) => {
                    log::warn!("[EMAIL] invalid ALERT_EMAIL_TO: {:?}", err);
                    return;
                }
            })
            .subject(subject)
            .body(body.to_string())
        {
            Ok(message) => message,
            Err(err) => {
                log::warn!("[EMAIL] failed to build message: {:?}", err);
                return;
            }
        };

        let transport = match SmtpTransport::relay(&settings.host) {
            Ok(builder) => builder
                .credentials(Credentials::new(
                    settings.username.clone(),
                    settings.password.clone(),
                ))
                .build(),
            Err(err) => {
                log::warn!("[EMAIL] failed to build SMTP transport: {:?}", err);
                return;
            }
        };

        if let Err(err) = transport.send(&message) {
            log::warn!("[EMAIL] failed to send '{}': {:?}", subject, err);
        }
    }
}
