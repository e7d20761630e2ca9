use std::fmt::Write;

use async_trait::async_trait;
use asyncworker::{
    informer::{Mail, MailError},
    prelude::*,
};
use asyncworker_redis::RedisStore;
use chrono::TimeDelta;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1";
const REDIS_URL: &str = "REDIS_URL";

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    let redis_url = std::env::var(REDIS_URL).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_owned());
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = Config::default()
        .with_runner(RunnerConfig::default().with_runtime(10).with_fuzz(2).with_block(1))
        .with_mail(MailConfig {
            to: Some("ops@example.com".to_owned()),
            from_address: Some("worker@example.com".to_owned()),
            ..Default::default()
        });
    let store = RedisStore::connect(&redis_url, "asyncworker:demo").await?;
    let registry = ExecutorRegistry::new().with_executor::<BasicJob>();
    let runner = RunnerLoop::new("main", store, registry, config.clone())
        .with_informer(MailInformer::new(PrintMailer, &config.mail));

    let job_id = BasicJob::builder("high")
        .with_payload_value("text", "First job")
        .dispatch(runner.messenger())
        .await?;
    println!("Dispatched job {job_id}");

    let job_id = BasicJob::builder("normal")
        .with_payload_value("text", "Second job")
        .delay_for(TimeDelta::seconds(2))
        .for_runner("main")
        .dispatch(runner.messenger())
        .await?;
    println!("Dispatched delayed job {job_id}");

    let outcome = runner.listen().await?;
    println!("Runner returned: {outcome:?}");
    Ok(())
}

struct BasicJob;

#[async_trait]
impl Executor for BasicJob {
    async fn execute(
        &self,
        job: &Job,
        output: &mut Output,
        report: &mut Report,
    ) -> Result<(), ExecutionError> {
        let text: Option<String> = job.payload_value("text").map_err(ExecutionError::other)?;
        let _ = writeln!(output, "{} running, with text: {text:?}", Self::NAME);
        report.insert("subject", format!("Finished {}", job.id));
        report.succeed();
        Ok(())
    }
}

impl NamedExecutor for BasicJob {
    const NAME: &'static str = "basic_job";

    fn build(_config: &Config) -> Self {
        BasicJob
    }
}

struct PrintMailer;

#[async_trait]
impl Mailer for PrintMailer {
    async fn send(&self, mail: Mail) -> Result<(), MailError> {
        let data = serde_json::to_string_pretty(&mail.data)
            .map_err(|error| MailError(error.to_string()))?;
        println!("To: {}\nSubject: {}\n\n{data}", mail.to, mail.subject);
        Ok(())
    }
}
