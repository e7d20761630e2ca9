//! Notifications about finished jobs.
//!
//! Informing is best effort: an [`Informer`] reports whether it informed anybody and never
//! affects the state of the job.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{executor::ReturnData, job::Job};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Informer: Send + Sync {
    /// Called once for every executed job with the data returned by its executor.
    async fn inform_about_job(&self, job: &Job, return_data: &ReturnData) -> bool;
}

/// Informs nobody.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInformer;

#[async_trait]
impl Informer for NoopInformer {
    async fn inform_about_job(&self, _job: &Job, _return_data: &ReturnData) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Default recipient. A job's own email takes precedence.
    pub to: Option<String>,
    pub from_name: Option<String>,
    /// Nothing is sent unless this is set.
    pub from_address: Option<String>,
    /// Used unless the executor returns a `"subject"`.
    pub subject: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            to: None,
            from_name: None,
            from_address: None,
            subject: "Async job report".to_owned(),
        }
    }
}

/// A notification ready to be rendered and delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub to: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub subject: String,
    /// The executor's return data, for the template of the mail body.
    pub data: ReturnData,
}

#[derive(Debug, Error)]
#[error("Failed to send mail: {0}")]
pub struct MailError(pub String);

/// Renders and delivers mails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Mail) -> Result<(), MailError>;
}

/// Mails a report about each job to the job's email or the configured recipient.
///
/// Jobs with `inform` switched off are skipped, as is everything when no sender is configured.
pub struct MailInformer<M> {
    mailer: M,
    config: MailConfig,
}

impl<M: Mailer> MailInformer<M> {
    pub fn new(mailer: M, config: &MailConfig) -> Self {
        Self {
            mailer,
            config: config.clone(),
        }
    }

    fn mail_for(&self, job: &Job, return_data: &ReturnData) -> Option<Mail> {
        if !job.inform {
            return None;
        }
        let to = job.email.as_ref().or(self.config.to.as_ref())?;
        let from_address = self.config.from_address.as_ref()?;
        let subject = return_data
            .get("subject")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&self.config.subject);

        Some(Mail {
            to: to.clone(),
            from_address: from_address.clone(),
            from_name: self.config.from_name.clone(),
            subject: subject.to_owned(),
            data: return_data.clone(),
        })
    }
}

#[async_trait]
impl<M: Mailer> Informer for MailInformer<M> {
    async fn inform_about_job(&self, job: &Job, return_data: &ReturnData) -> bool {
        let Some(mail) = self.mail_for(job, return_data) else {
            return false;
        };
        let to = mail.to.clone();
        match self.mailer.send(mail).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, %to, "Informed {to} about job {}", job.id);
                true
            }
            Err(error) => {
                tracing::error!(job_id = %job.id, %to, ?error, "Failed to inform {to}: {error}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::function;

    use super::*;

    fn config() -> MailConfig {
        MailConfig {
            to: Some("ops@example.com".to_owned()),
            from_address: Some("worker@example.com".to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn noop_informs_nobody() {
        let job = Job::new("report", "normal");

        assert!(!NoopInformer.inform_about_job(&job, &ReturnData::new()).await);
    }

    #[tokio::test]
    async fn mails_configured_recipient() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .with(function(|mail: &Mail| {
                mail.to == "ops@example.com"
                    && mail.from_address == "worker@example.com"
                    && mail.subject == "Async job report"
            }))
            .times(1)
            .returning(|_| Ok(()));
        let informer = MailInformer::new(mailer, &config());

        assert!(
            informer
                .inform_about_job(&Job::new("report", "normal"), &ReturnData::new())
                .await
        );
    }

    #[tokio::test]
    async fn job_email_and_returned_subject_take_precedence() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .with(function(|mail: &Mail| {
                mail.to == "john@example.com" && mail.subject == "Report ready"
            }))
            .times(1)
            .returning(|_| Ok(()));
        let informer = MailInformer::new(mailer, &config());
        let job = Job::builder("report", "normal")
            .with_email("john@example.com")
            .build();
        let mut data = ReturnData::new();
        data.insert("subject".to_owned(), "Report ready".into());

        assert!(informer.inform_about_job(&job, &data).await);
    }

    #[tokio::test]
    async fn skips_jobs_without_inform() {
        let mut mailer = MockMailer::new();
        mailer.expect_send().never();
        let informer = MailInformer::new(mailer, &config());
        let job = Job::builder("report", "normal").without_inform().build();

        assert!(!informer.inform_about_job(&job, &ReturnData::new()).await);
    }

    #[tokio::test]
    async fn skips_without_sender_or_recipient() {
        let mut mailer = MockMailer::new();
        mailer.expect_send().never();
        let job = Job::new("report", "normal");

        let no_sender = MailConfig {
            from_address: None,
            ..config()
        };
        let informer = MailInformer::new(mailer, &no_sender);
        assert!(!informer.inform_about_job(&job, &ReturnData::new()).await);

        let mut mailer = MockMailer::new();
        mailer.expect_send().never();
        let no_recipient = MailConfig {
            to: None,
            ..config()
        };
        let informer = MailInformer::new(mailer, &no_recipient);
        assert!(!informer.inform_about_job(&job, &ReturnData::new()).await);
    }

    #[tokio::test]
    async fn mailer_errors_are_reported_as_false() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .times(1)
            .returning(|_| Err(MailError("connection refused".to_owned())));
        let informer = MailInformer::new(mailer, &config());

        assert!(
            !informer
                .inform_about_job(&Job::new("report", "normal"), &ReturnData::new())
                .await
        );
    }
}
