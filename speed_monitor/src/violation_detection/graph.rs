use anyhow::anyhow;
use crossbeam::channel::{unbounded, Receiver, Sender};
use rusted_pipe::{
    buffers::synchronizers::timestamp::TimestampSynchronizer,
    channels::{
        read_channel::InputGenerator, typed_read_channel::ReadChannel1,
        typed_write_channel::WriteChannel1,
    },
    graph::{
        build::{link, Graph},
        metrics::Metrics,
        processor::{ProcessorWriter, SourceNode, SourceProcessor, TerminalNode, TerminalProcessor},
    },
    DataVersion, RustedPipeError,
};
use std::time::Duration;
use tracing::{debug, error, info};

use super::frame_source::FrameSource;
use super::orchestrator::{capture_for_trigger, Orchestrator, Outcome};
use super::sensor_gate::{PollLimiter, SensorError, SensorGate};
use super::{exceeds_threshold, Capture};

/// Source node: polls the sensor and emits a frame for every reading above
/// the threshold.
pub struct TriggerCapture {
    sensor: Box<dyn SensorGate + Send>,
    source: Box<dyn FrameSource + Send>,
    threshold: f64,
    limiter: PollLimiter,
    done_sender: Sender<bool>,
    done_receiver: Receiver<bool>,
}

impl TriggerCapture {
    pub fn new(
        sensor: Box<dyn SensorGate + Send>,
        source: Box<dyn FrameSource + Send>,
        threshold: f64,
        poll_interval: Duration,
    ) -> Self {
        let (done_sender, done_receiver) = unbounded();
        Self {
            sensor,
            source,
            threshold,
            limiter: PollLimiter::new(poll_interval),
            done_sender,
            done_receiver,
        }
    }

    /// Fires once the sensor has no more readings.
    pub fn get_done_event(&self) -> Receiver<bool> {
        self.done_receiver.clone()
    }

    /// One sensor poll. `Ok(None)` when nothing should be emitted, including
    /// a trigger whose capture failed.
    pub fn poll(&mut self) -> Result<Option<Capture>, SensorError> {
        let Some(speed) = self.sensor.read_speed()? else {
            return Ok(None);
        };
        if !exceeds_threshold(speed, self.threshold) {
            debug!("Speed {speed:.1} m/s within the limit");
            return Ok(None);
        }
        info!("Speed violation detected: {speed:.1} m/s");
        Ok(capture_for_trigger(speed, self.source.as_mut()).ok())
    }
}

impl SourceProcessor for TriggerCapture {
    type OUTPUT = WriteChannel1<Capture>;
    fn handle(&mut self, mut output: ProcessorWriter<Self::OUTPUT>) -> Result<(), RustedPipeError> {
        self.limiter.wait();
        match self.poll() {
            Ok(Some(capture)) => {
                output.writer.c1().write(capture, &DataVersion::from_now())?;
            }
            Ok(None) => {}
            Err(SensorError::Exhausted) => {
                info!("Sensor exhausted, stopping");
                let _ = self.done_sender.send(true);
                return Err(RustedPipeError::EndOfStream());
            }
            Err(err) => error!("Sensor read failed: {err}"),
        }
        Ok(())
    }
}

unsafe impl Send for TriggerCapture {}
unsafe impl Sync for TriggerCapture {}

/// Terminal node: runs the per-trigger pipeline on each buffered capture.
pub struct ViolationSink {
    orchestrator: Orchestrator,
}

impl ViolationSink {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn consume(&mut self, capture: Capture) -> Outcome {
        let outcome = self.orchestrator.process_capture(capture);
        debug!("Trigger finished: {outcome:?}");
        outcome
    }
}

impl TerminalProcessor for ViolationSink {
    type INPUT = ReadChannel1<Capture>;
    fn handle(
        &mut self,
        mut input: <Self::INPUT as InputGenerator>::INPUT,
    ) -> Result<(), RustedPipeError> {
        if let Some(packet) = input.c1_owned() {
            self.consume(packet.data);
        }
        Ok(())
    }
}

unsafe impl Send for ViolationSink {}
unsafe impl Sync for ViolationSink {}

/// Wire `trigger` into `sink` through a non-blocking buffer of `capacity`
/// captures and start both nodes. A full buffer evicts its oldest capture.
pub fn build_live_graph(
    trigger: TriggerCapture,
    sink: ViolationSink,
    capacity: usize,
) -> anyhow::Result<(Graph, Receiver<bool>)> {
    let done = trigger.get_done_event();
    let capacity = capacity.max(1);

    let mut trigger_node =
        SourceNode::create_common("trigger_capture".to_string(), Box::new(trigger));
    let sink_node = TerminalNode::create_common(
        "violation_sink".to_string(),
        Box::new(sink),
        false,
        capacity,
        capacity,
        Box::new(TimestampSynchronizer::default()),
        true,
    );

    {
        let mut channels = sink_node
            .read_channel
            .channels
            .write()
            .map_err(|_| anyhow!("violation_sink channels lock poisoned"))?;
        link(trigger_node.write_channel.writer.c1(), channels.c1())
            .map_err(|err| anyhow!("cannot link trigger_capture to violation_sink: {err:?}"))?;
    }

    let mut graph = Graph::new(Metrics::no_metrics());
    graph.start_terminal_node(sink_node);
    graph.start_source_node(trigger_node);

    Ok((graph, done))
}
