mod consume;
mod produce;

use async_trait::async_trait;
pub use consume::ConsumeCommand;
pub use produce::ProduceCommand;

use crate::broker::Cluster;
use crate::error::CliError;
use std::io::Write;

#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(
        &self,
        cluster: &dyn Cluster,
        out: &mut (dyn Write + Send),
    ) -> Result<(), CliError>;
}
