use super::Command;
use crate::broker::{Cluster, PartitionStream};
use crate::config::ConsumeArgs;
use crate::error::CliError;
use crate::format::Template;
use crate::protocol::{Assignment, ConsumeRequest, Record};
use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::io::Write;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type Merged = Result<Record, CliError>;

/// Streams every requested partition into one output until interrupted.
pub struct ConsumeCommand {
    pub request: ConsumeRequest,
    /// Capacity of the channel all partition tasks feed.
    pub buffer_size: usize,
    /// When false, stream errors are logged and the partition keeps going.
    pub fail_on_stream_error: bool,
}

impl ConsumeCommand {
    pub fn from_args(args: ConsumeArgs, buffer_size: usize) -> Result<Self, CliError> {
        let template = Template::parse(&args.format)?;
        Ok(Self {
            request: ConsumeRequest {
                topics: args.topics,
                partition: ConsumeRequest::partition_selector(args.partition),
                offset: args.offset,
                template,
            },
            buffer_size,
            fail_on_stream_error: args.tuning.return_errors,
        })
    }

    /// Runs until `shutdown` is cancelled or a partition stream fails.
    /// Every partition task has closed its stream by the time this returns.
    pub async fn run(
        &self,
        cluster: &dyn Cluster,
        out: &mut (dyn Write + Send),
        shutdown: CancellationToken,
    ) -> Result<(), CliError> {
        if self.request.topics.is_empty() {
            writeln!(out, "topic is required")?;
            display_topics(cluster, out).await?;
            return Err(CliError::MissingTopic);
        }

        let assignments =
            resolve_assignments(cluster, &self.request.topics, self.request.partition).await?;
        let streams = cluster.open(&assignments, self.request.offset).await?;
        info!(
            "Consuming {} partition(s) starting at {}",
            streams.len(),
            self.request.offset
        );
        debug!("Output template {:?}", self.request.template.source());

        let (tx, mut rx) = mpsc::channel::<Merged>(self.buffer_size);
        let mut tasks = JoinSet::new();
        for stream in streams {
            tasks.spawn(consume_partition(
                stream,
                tx.clone(),
                shutdown.clone(),
                self.fail_on_stream_error,
            ));
        }
        drop(tx);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                item = rx.recv() => match item {
                    Some(Ok(record)) => self.print(out, &record),
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
            }
        };

        shutdown.cancel();
        drop(rx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Partition task failed: {}", e);
            }
        }
        result
    }

    fn print(&self, out: &mut (dyn Write + Send), record: &Record) {
        let written = self
            .request
            .template
            .render(out, record, &Local::now())
            .and_then(|_| out.flush());
        if let Err(e) = written {
            debug!(
                "Failed to print {}({}:{})",
                record.topic, record.partition, record.offset
            );
            eprintln!("WARN: {}", e);
        }
    }
}

#[async_trait]
impl Command for ConsumeCommand {
    async fn execute(
        &self,
        cluster: &dyn Cluster,
        out: &mut (dyn Write + Send),
    ) -> Result<(), CliError> {
        let shutdown = CancellationToken::new();
        let interrupt = shutdown.clone();
        let watcher = tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping consumers");
                interrupt.cancel();
            }
        });

        let result = self.run(cluster, out, shutdown).await;
        watcher.abort();
        result
    }
}

/// Expands the requested topics into the (topic, partition) pairs to open.
/// With no explicit partition every partition of each topic is used, as
/// known at call time. An explicit partition must exist in every topic.
pub async fn resolve_assignments(
    cluster: &dyn Cluster,
    topics: &[String],
    partition: Option<i32>,
) -> Result<Vec<Assignment>, CliError> {
    let mut seen = HashSet::new();
    let mut assignments = Vec::new();
    for topic in topics.iter().filter(|t| seen.insert(t.as_str())) {
        let partitions = cluster.partitions(topic).await?;
        debug!("{} has partitions {:?}", topic, partitions);
        match partition {
            Some(p) if partitions.contains(&p) => {
                assignments.push(Assignment::new(topic.as_str(), p))
            }
            Some(p) => {
                return Err(CliError::PartitionOpen {
                    topic: topic.clone(),
                    partition: p,
                    reason: format!("topic has partitions {:?}", partitions),
                })
            }
            None => {
                assignments.extend(
                    partitions
                        .into_iter()
                        .map(|p| Assignment::new(topic.as_str(), p)),
                );
            }
        }
    }
    Ok(assignments)
}

async fn display_topics(
    cluster: &dyn Cluster,
    out: &mut (dyn Write + Send),
) -> Result<(), CliError> {
    let topics = cluster.topics().await?;
    writeln!(out, "Available topics:")?;
    for topic in topics {
        writeln!(out, "  {}", topic)?;
    }
    Ok(())
}

async fn consume_partition(
    mut stream: Box<dyn PartitionStream>,
    tx: mpsc::Sender<Merged>,
    shutdown: CancellationToken,
    fail_on_error: bool,
) {
    let assignment = stream.assignment().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.recv() => next,
        };

        let item = match next {
            Ok(record) => Ok(record),
            Err(e) if fail_on_error => Err(e),
            Err(e) => {
                eprintln!("WARN: {}", e);
                continue;
            }
        };
        let fatal = item.is_err();

        // A full channel must not keep the task alive past cancellation.
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if fatal {
            break;
        }
    }
    stream.close().await;
    debug!("{} closed", assignment);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MemoryCluster;
    use crate::protocol::Offset;
    use std::time::Duration;

    fn command(topics: &[&str], partition: Option<i32>, offset: Offset) -> ConsumeCommand {
        ConsumeCommand {
            request: ConsumeRequest {
                topics: topics.iter().map(|t| t.to_string()).collect(),
                partition,
                offset,
                template: Template::default(),
            },
            buffer_size: 256,
            fail_on_stream_error: true,
        }
    }

    /// Runs the command and cancels it after `after`.
    async fn run_for(
        cmd: &ConsumeCommand,
        cluster: &MemoryCluster,
        after: Duration,
    ) -> (Result<(), CliError>, String) {
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            stopper.cancel();
        });
        let mut out: Vec<u8> = Vec::new();
        let result = cmd.run(cluster, &mut out, shutdown).await;
        timer.abort();
        (result, String::from_utf8(out).unwrap())
    }

    /// (partition, offset) pairs parsed from default-template lines.
    fn positions(output: &str, topic: &str) -> Vec<(i32, i64)> {
        let marker = format!(" {}(", topic);
        output
            .lines()
            .filter_map(|line| {
                let start = line.find(&marker)? + marker.len();
                let end = start + line[start..].find(')')?;
                let (p, o) = line[start..end].split_once(':')?;
                Some((p.parse().ok()?, o.parse().ok()?))
            })
            .collect()
    }

    #[tokio::test]
    async fn explicit_partition_from_offset_zero_prints_in_order() {
        let cluster = MemoryCluster::new()
            .with_topic("mytopic", 2)
            .with_values("mytopic", 0, &["first", "second"])
            .with_values("mytopic", 1, &["other"]);
        let cmd = command(&["mytopic"], Some(0), Offset::At(0));

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(100)).await;

        result.unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" mytopic(0:0) first"));
        assert!(lines[1].ends_with(" mytopic(0:1) second"));
        assert_eq!(cluster.opened(), vec![Assignment::new("mytopic", 0)]);
    }

    #[tokio::test]
    async fn all_partitions_of_every_topic_are_opened() {
        let cluster = MemoryCluster::new()
            .with_topic("topicA", 2)
            .with_topic("topicB", 1);
        let cmd = command(&["topicA", "topicB"], None, Offset::Newest);

        let (result, _) = run_for(&cmd, &cluster, Duration::from_millis(50)).await;

        result.unwrap();
        assert_eq!(
            cluster.opened(),
            vec![
                Assignment::new("topicA", 0),
                Assignment::new("topicA", 1),
                Assignment::new("topicB", 0),
            ]
        );
    }

    #[tokio::test]
    async fn explicit_partition_applies_to_every_topic() {
        let cluster = MemoryCluster::new()
            .with_topic("a", 3)
            .with_topic("b", 3);
        let topics = vec!["a".to_string(), "b".to_string(), "a".to_string()];

        let assignments = resolve_assignments(&cluster, &topics, Some(2)).await.unwrap();

        assert_eq!(
            assignments,
            vec![Assignment::new("a", 2), Assignment::new("b", 2)]
        );
    }

    #[tokio::test]
    async fn explicit_partition_must_exist() {
        let cluster = MemoryCluster::new().with_topic("real", 1);

        let missing_topic = vec!["nosuch".to_string(), "real".to_string()];
        let err = resolve_assignments(&cluster, &missing_topic, Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::TopicNotFound(t) if t == "nosuch"));

        let real = vec!["real".to_string()];
        let err = resolve_assignments(&cluster, &real, Some(7)).await.unwrap_err();
        assert!(matches!(
            err,
            CliError::PartitionOpen { ref topic, partition: 7, .. } if topic == "real"
        ));
    }

    #[tokio::test]
    async fn out_of_range_partition_fails_instead_of_idling() {
        let cluster = MemoryCluster::new().with_topic("real", 1);
        let cmd = command(&["real"], Some(99), Offset::Newest);

        let (result, _) = tokio::time::timeout(
            Duration::from_secs(5),
            run_for(&cmd, &cluster, Duration::from_secs(60)),
        )
        .await
        .expect("run kept idling on a missing partition");

        assert!(matches!(result, Err(CliError::PartitionOpen { partition: 99, .. })));
        assert!(cluster.opened().is_empty());
    }

    #[tokio::test]
    async fn unknown_topic_is_fatal_and_opens_nothing() {
        let cluster = MemoryCluster::new().with_topic("known", 1);
        let cmd = command(&["known", "missing"], None, Offset::Oldest);

        let (result, _) = run_for(&cmd, &cluster, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(CliError::TopicNotFound(t)) if t == "missing"));
        assert!(cluster.opened().is_empty());
    }

    #[tokio::test]
    async fn no_topics_lists_available_topics() {
        let cluster = MemoryCluster::new()
            .with_topic("alpha", 1)
            .with_topic("beta", 1);
        let cmd = command(&[], None, Offset::Newest);

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(10)).await;

        assert!(matches!(result, Err(CliError::MissingTopic)));
        assert!(output.starts_with("topic is required\n"));
        assert!(output.contains("  alpha\n"));
        assert!(output.contains("  beta\n"));
        assert!(cluster.opened().is_empty());
    }

    #[tokio::test]
    async fn offsets_stay_ordered_within_each_partition() {
        let values: Vec<String> = (0..20).map(|i| format!("v{}", i)).collect();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let cluster = MemoryCluster::new()
            .with_topic("t", 3)
            .with_values("t", 0, &refs)
            .with_values("t", 1, &refs)
            .with_values("t", 2, &refs);
        let cmd = command(&["t"], None, Offset::Oldest);

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(200)).await;

        result.unwrap();
        let seen = positions(&output, "t");
        assert_eq!(seen.len(), 60);
        for partition in 0..3 {
            let offsets: Vec<i64> = seen
                .iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, o)| *o)
                .collect();
            assert_eq!(offsets, (0..20).collect::<Vec<i64>>());
        }
    }

    #[tokio::test]
    async fn small_buffer_applies_backpressure_without_loss() {
        let values: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let cluster = MemoryCluster::new()
            .with_topic("t", 1)
            .with_values("t", 0, &refs);
        let mut cmd = command(&["t"], Some(0), Offset::Oldest);
        cmd.buffer_size = 1;

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(200)).await;

        result.unwrap();
        let offsets: Vec<i64> = positions(&output, "t").into_iter().map(|(_, o)| o).collect();
        assert_eq!(offsets, (0..50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn newest_offset_skips_existing_messages() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 1)
            .with_values("t", 0, &["old"]);
        let cmd = command(&["t"], None, Offset::Newest);

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(50)).await;

        result.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn interrupt_closes_idle_partitions() {
        let cluster = MemoryCluster::new()
            .with_topic("quiet", 3);
        let cmd = command(&["quiet"], None, Offset::Newest);

        let (result, output) = tokio::time::timeout(
            Duration::from_secs(5),
            run_for(&cmd, &cluster, Duration::from_millis(20)),
        )
        .await
        .expect("consume did not stop after cancellation");

        result.unwrap();
        assert!(output.is_empty());
        assert_eq!(cluster.closed(), 3);
    }

    #[tokio::test]
    async fn stream_error_aborts_the_whole_run() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 2)
            .with_values("t", 0, &["ok"])
            .failing("t", 1);
        let cmd = command(&["t"], None, Offset::Oldest);

        // Far longer than the run should take; the error ends it first.
        let (result, _) = tokio::time::timeout(
            Duration::from_secs(5),
            run_for(&cmd, &cluster, Duration::from_secs(60)),
        )
        .await
        .expect("stream error did not end the run");

        assert!(matches!(
            result,
            Err(CliError::Stream { ref topic, partition: 1, .. }) if topic == "t"
        ));
        assert_eq!(cluster.closed(), 2);
    }

    #[tokio::test]
    async fn stream_errors_are_skipped_when_not_returned() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 1)
            .with_values("t", 0, &["a", "b"])
            .failing("t", 0);
        let mut cmd = command(&["t"], None, Offset::Oldest);
        cmd.fail_on_stream_error = false;

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(100)).await;

        result.unwrap();
        assert_eq!(output.lines().count(), 2);
    }

    #[tokio::test]
    async fn open_failure_is_fatal() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 2)
            .unopenable("t", 1);
        let cmd = command(&["t"], None, Offset::Newest);

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(CliError::PartitionOpen { partition: 1, .. })));
        assert!(output.is_empty());
        assert_eq!(cluster.closed(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_a_task_blocked_on_a_full_channel() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 1)
            .with_values("t", 0, &["a", "b", "c"]);
        let mut streams = cluster
            .open(&[Assignment::new("t", 0)], Offset::Oldest)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel::<Merged>(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consume_partition(
            streams.remove(0),
            tx,
            shutdown.clone(),
            true,
        ));

        // Nobody reads, so the task fills the channel and blocks on "b".
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task kept waiting on the full channel")
            .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.offset, 0);
        assert!(rx.recv().await.is_none());
        assert_eq!(cluster.closed(), 1);
    }

    /// Rejects the first `failures` writes, then behaves like a buffer.
    struct FlakyOutput {
        failures: usize,
        written: Vec<u8>,
    }

    impl Write for FlakyOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"));
            }
            self.written.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn render_failure_does_not_stop_consumption() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 1)
            .with_values("t", 0, &["a", "b", "c"]);
        let cmd = command(&["t"], Some(0), Offset::Oldest);
        let mut out = FlakyOutput {
            failures: 1,
            written: Vec::new(),
        };
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        let result = cmd.run(&cluster, &mut out, shutdown).await;
        timer.abort();

        result.unwrap();
        let output = String::from_utf8(out.written).unwrap();
        let offsets: Vec<i64> = positions(&output, "t").into_iter().map(|(_, o)| o).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn custom_template_is_used() {
        let cluster = MemoryCluster::new()
            .with_topic("t", 1)
            .with_values("t", 0, &["payload"]);
        let mut cmd = command(&["t"], Some(0), Offset::Oldest);
        cmd.request.template = Template::parse("{Topic}/{Partition}/{Offset}={Value}").unwrap();

        let (result, output) = run_for(&cmd, &cluster, Duration::from_millis(50)).await;

        result.unwrap();
        assert_eq!(output, "t/0/0=payload\n");
    }
}
