use super::Command;
use crate::broker::Cluster;
use crate::config::ProduceArgs;
use crate::error::CliError;
use crate::protocol::OutgoingMessage;
use async_trait::async_trait;
use log::info;
use std::io::Write;
use std::path::PathBuf;

/// Publishes the contents of one file as a single message.
pub struct ProduceCommand {
    pub topic: String,
    pub path: PathBuf,
    pub key: Option<String>,
    pub required_acks: i16,
}

impl From<ProduceArgs> for ProduceCommand {
    fn from(args: ProduceArgs) -> Self {
        Self {
            topic: args.topic,
            path: args.file,
            key: args.key,
            required_acks: args.required_acks,
        }
    }
}

#[async_trait]
impl Command for ProduceCommand {
    async fn execute(
        &self,
        cluster: &dyn Cluster,
        out: &mut (dyn Write + Send),
    ) -> Result<(), CliError> {
        let value = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CliError::FileRead {
                path: self.path.clone(),
                source,
            })?;

        let message = OutgoingMessage {
            topic: self.topic.clone(),
            key: self.key.clone().filter(|k| !k.is_empty()),
            value,
        };
        info!(
            "Sending {} bytes from {} to {} (acks={})",
            message.value.len(),
            self.path.display(),
            self.topic,
            self.required_acks
        );

        let delivery = cluster.send(message, self.required_acks).await?;
        writeln!(
            out,
            "Sent to {}, partition: {}, offset: {}",
            self.topic, delivery.partition, delivery.offset
        )?;
        Ok(())
    }
}
