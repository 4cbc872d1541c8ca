use serde::Serialize;
use tracing::{debug, info, warn};

use super::identity::IdentityContext;
use super::output::OutputWriter;
use super::schedule::{BlockGroupSchedule, BlockSchedule, RunSchedule, SessionSchedule};
use super::source::TrialSource;
use crate::error::{Result, RtError};
use crate::ipc::client::{CommandChannel, expect_success, reply_fields};
use crate::ipc::protocol::{BlkGrpRef, Message, MsgEvent, ReplyFields, SessionFields, TrainFields};
use crate::worker::CancelFlag;

/// Block groups the model trains on at the end of `run_id`.
pub fn training_refs(run_id: u32) -> [BlkGrpRef; 2] {
    match run_id {
        0 | 1 => [BlkGrpRef::new(1, 1), BlkGrpRef::new(1, 2)],
        2 => [BlkGrpRef::new(1, 2), BlkGrpRef::new(2, 1)],
        n => [BlkGrpRef::new(n - 1, 1), BlkGrpRef::new(n, 1)],
    }
}

/// Session id used when the schedule does not name one.
pub fn default_session_id() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Client side of the experiment protocol.
///
/// Walks a schedule scope by scope, sending one command per transition and
/// waiting for its reply before moving on. The first error reply ends the
/// run; nothing further is sent for it.
pub struct RunDriver<C, S, O> {
    channel: C,
    source: S,
    output: O,
    ids: IdentityContext,
    cancel: CancelFlag,
}

impl<C, S, O> RunDriver<C, S, O>
where
    C: CommandChannel,
    S: TrialSource,
    O: OutputWriter,
{
    pub fn new(channel: C, source: S, output: O) -> Self {
        Self {
            channel,
            source,
            output,
            ids: IdentityContext::new(default_session_id()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.ids
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_parts(self) -> (C, S, O) {
        (self.channel, self.source, self.output)
    }

    /// Run every scheduled run between StartSession and EndSession.
    pub async fn run_session(&mut self, schedule: &SessionSchedule) -> Result<()> {
        if let Some(id) = &schedule.session_id {
            self.ids.session_id = id.clone();
        }
        let session = SessionFields {
            session_id: self.ids.session_id.clone(),
        };
        info!(session = %session.session_id, runs = schedule.runs.len(), "session starting");

        self.send(MsgEvent::StartSession, &session, None).await?;
        for run in &schedule.runs {
            self.run_run(run).await?;
        }
        self.send(MsgEvent::EndSession, &session, None).await?;

        info!(session = %session.session_id, "session finished");
        Ok(())
    }

    /// Drive one run. On failure the run-scoped identity is cleared so a
    /// later run starts clean. The output writer is told the run is over
    /// either way.
    pub async fn run_run(&mut self, run: &RunSchedule) -> Result<()> {
        if self.ids.in_run() {
            return Err(RtError::domain(format!(
                "cannot start run {} while another run is active",
                run.run_id
            )));
        }
        let result = self.drive_run(run).await;
        if let Err(e) = &result {
            warn!(run = run.run_id, error = %e, "run aborted");
            self.ids.leave_run();
        }
        let closed = self.output.end_run();
        result.and(closed)
    }

    async fn drive_run(&mut self, run: &RunSchedule) -> Result<()> {
        info!(run = run.run_id, trials = run.trial_count(), "run starting");
        self.output.begin_run(run.run_id)?;

        let run_cfg = run.fields();
        self.ids.enter_run(run.run_id);
        self.send(MsgEvent::StartRun, &run_cfg, None).await?;

        for group in &run.block_groups {
            self.drive_block_group(run, group).await?;
        }

        let train = TrainFields {
            blk_grp_refs: training_refs(run.run_id).to_vec(),
        };
        self.send(MsgEvent::TrainModel, &train, None).await?;
        self.send(MsgEvent::EndRun, &run_cfg, None).await?;
        self.ids.leave_run();

        info!(run = run.run_id, "run finished");
        Ok(())
    }

    async fn drive_block_group(
        &mut self,
        run: &RunSchedule,
        group: &BlockGroupSchedule,
    ) -> Result<()> {
        let cfg = group.fields();
        self.ids.enter_block_group(group.blk_grp_id);
        self.send(MsgEvent::StartBlockGroup, &cfg, None).await?;

        for block in &group.blocks {
            self.drive_block(run, block).await?;
        }

        self.send(MsgEvent::EndBlockGroup, &cfg, None).await?;
        self.ids.leave_block_group();
        Ok(())
    }

    async fn drive_block(&mut self, run: &RunSchedule, block: &BlockSchedule) -> Result<()> {
        let cfg = block.fields();
        self.ids.enter_block(block.block_id);
        self.send(MsgEvent::StartBlock, &cfg, None).await?;

        for trial in &block.trials {
            self.ids.enter_trial(trial.tr_id);
            self.cancel.check()?;
            let payload = self.source.load(run, trial).await?;
            let trial_cfg = trial.fields(run.file_num(trial.vol), payload.features);
            let reply = self
                .send(MsgEvent::TrialData, &trial_cfg, payload.data)
                .await?;
            if let Some(prediction) = &reply.predict {
                self.output.write_prediction(prediction)?;
            }
        }
        self.ids.leave_trial();

        self.send(MsgEvent::EndBlock, &cfg, None).await?;
        self.ids.leave_block();
        Ok(())
    }

    async fn send<T: Serialize + Sync>(
        &mut self,
        event: MsgEvent,
        cfg: &T,
        data: Option<Vec<u8>>,
    ) -> Result<ReplyFields> {
        self.cancel.check()?;
        let mut msg = Message::command(event, &self.ids, cfg)?;
        if let Some(data) = data {
            msg = msg.with_data(data);
        }
        debug!(?event, ids = ?self.ids, "sending command");

        let reply = expect_success(self.channel.request(msg).await?)?;
        let fields = reply_fields(&reply)?;
        self.output.write_lines(&fields.outputlns)?;
        Ok(fields)
    }
}

impl<C, S, O> std::fmt::Debug for RunDriver<C, S, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDriver")
            .field("ids", &self.ids)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::dispatcher::CommandDispatcher;
    use crate::ipc::protocol::{Prediction, TrialFields};
    use crate::model::ModelRegistry;
    use crate::run::output::RunOutputDir;
    use crate::run::schedule::TrialSchedule;
    use crate::run::source::ReplaySource;

    /// Records every command and answers with success, except for the
    /// `fail_at`th request which gets an error reply.
    #[derive(Default)]
    struct ScriptedChannel {
        sent: Vec<(MsgEvent, IdentityContext)>,
        fail_at: Option<usize>,
        predict: bool,
    }

    impl CommandChannel for ScriptedChannel {
        async fn request(&mut self, msg: Message) -> Result<Message> {
            let ids: IdentityContext = msg.field_as("ids")?;
            self.sent.push((msg.event_type, ids));
            if self.fail_at == Some(self.sent.len()) {
                return Ok(Message::error_reply(msg.id, &RtError::domain("model failed")));
            }
            let mut reply = Message::success_reply(msg.id);
            if self.predict && msg.event_type == MsgEvent::TrialData {
                let trial: TrialFields = msg.field_as("cfg")?;
                reply.set_fields(&ReplyFields {
                    outputlns: vec![format!("trial {}", trial.tr_id)],
                    predict: Some(Prediction {
                        vol: trial.vol,
                        catsep: 0.5,
                    }),
                })?;
            }
            Ok(reply)
        }
    }

    /// Hands each request straight to a dispatcher, as the server loop would.
    struct InProcess(CommandDispatcher);

    impl CommandChannel for InProcess {
        async fn request(&mut self, msg: Message) -> Result<Message> {
            Ok(self.0.handle(&msg).0)
        }
    }

    #[derive(Default)]
    struct MemoryOutput {
        runs: Vec<u32>,
        ended: usize,
        lines: Vec<String>,
        predictions: Vec<Prediction>,
    }

    impl OutputWriter for MemoryOutput {
        fn begin_run(&mut self, run_id: u32) -> Result<()> {
            self.runs.push(run_id);
            Ok(())
        }

        fn end_run(&mut self) -> Result<()> {
            self.ended += 1;
            Ok(())
        }

        fn write_lines(&mut self, lines: &[String]) -> Result<()> {
            self.lines.extend_from_slice(lines);
            Ok(())
        }

        fn write_prediction(&mut self, prediction: &Prediction) -> Result<()> {
            self.predictions.push(prediction.clone());
            Ok(())
        }
    }

    fn trial(tr_id: u32, vol: u32) -> TrialSchedule {
        TrialSchedule {
            tr_id,
            vol,
            data: Some(vec![vol as f64]),
        }
    }

    fn run(run_id: u32) -> RunSchedule {
        RunSchedule {
            run_id,
            scan_num: 3,
            disdaqs: 0,
            tr_time: 2,
            block_groups: vec![
                BlockGroupSchedule {
                    blk_grp_id: 1,
                    blocks: vec![BlockSchedule {
                        block_id: 1,
                        trials: vec![trial(1, 1), trial(2, 2)],
                    }],
                },
                BlockGroupSchedule {
                    blk_grp_id: 2,
                    blocks: vec![BlockSchedule {
                        block_id: 1,
                        trials: vec![trial(1, 3)],
                    }],
                },
            ],
        }
    }

    fn driver(channel: ScriptedChannel) -> RunDriver<ScriptedChannel, ReplaySource, MemoryOutput> {
        RunDriver::new(channel, ReplaySource, MemoryOutput::default())
    }

    fn events(driver: &mut RunDriver<ScriptedChannel, ReplaySource, MemoryOutput>) -> Vec<MsgEvent> {
        driver.channel_mut().sent.iter().map(|(e, _)| *e).collect()
    }

    #[test]
    fn training_refs_follow_run_number() {
        assert_eq!(
            training_refs(1),
            [BlkGrpRef::new(1, 1), BlkGrpRef::new(1, 2)]
        );
        assert_eq!(
            training_refs(2),
            [BlkGrpRef::new(1, 2), BlkGrpRef::new(2, 1)]
        );
        assert_eq!(
            training_refs(5),
            [BlkGrpRef::new(4, 1), BlkGrpRef::new(5, 1)]
        );
    }

    #[tokio::test]
    async fn run_sends_commands_in_scope_order() {
        let mut driver = driver(ScriptedChannel::default());
        driver.run_run(&run(1)).await.unwrap();

        use MsgEvent::*;
        assert_eq!(
            events(&mut driver),
            vec![
                StartRun,
                StartBlockGroup,
                StartBlock,
                TrialData,
                TrialData,
                EndBlock,
                EndBlockGroup,
                StartBlockGroup,
                StartBlock,
                TrialData,
                EndBlock,
                EndBlockGroup,
                TrainModel,
                EndRun,
            ]
        );
        assert!(!driver.identity().in_run());
    }

    #[tokio::test]
    async fn identity_tracks_scope_entry_and_exit() {
        let mut driver = driver(ScriptedChannel::default());
        driver.run_run(&run(1)).await.unwrap();

        let sent = &driver.channel_mut().sent;
        let (_, start_run) = &sent[0];
        assert_eq!(start_run.run_id(), Some(1));
        assert_eq!(start_run.blk_grp_id(), None);

        let (_, first_trial) = &sent[3];
        assert_eq!(first_trial.block_id(), Some(1));
        assert_eq!(first_trial.tr_id(), Some(1));

        let (_, end_block) = &sent[5];
        assert_eq!(end_block.block_id(), Some(1));
        assert_eq!(end_block.tr_id(), None);

        let (_, train) = &sent[12];
        assert_eq!(train.run_id(), Some(1));
        assert_eq!(train.blk_grp_id(), None);
    }

    #[tokio::test]
    async fn error_reply_stops_the_run() {
        // Fail the second trial: request 5 of the run
        let channel = ScriptedChannel {
            fail_at: Some(5),
            ..Default::default()
        };
        let mut driver = driver(channel);

        let result = driver.run_run(&run(1)).await;
        match result {
            Err(RtError::Domain(text)) => assert_eq!(text, "model failed"),
            other => panic!("expected domain error, got {:?}", other),
        }
        assert_eq!(driver.channel_mut().sent.len(), 5);
        assert!(!events(&mut driver).contains(&MsgEvent::EndRun));
        assert!(!driver.identity().in_run());

        let (_, _, output) = driver.into_parts();
        assert_eq!(output.ended, 1);
    }

    #[tokio::test]
    async fn error_in_session_skips_later_runs() {
        let channel = ScriptedChannel {
            fail_at: Some(3),
            ..Default::default()
        };
        let mut driver = driver(channel);
        let schedule = SessionSchedule {
            session_id: Some("s9".to_string()),
            runs: vec![run(1), run(2)],
        };

        assert!(driver.run_session(&schedule).await.is_err());
        let sent = events(&mut driver);
        assert_eq!(sent.len(), 3);
        assert!(!sent.contains(&MsgEvent::EndSession));
    }

    #[tokio::test]
    async fn session_wraps_runs() {
        let channel = ScriptedChannel {
            predict: true,
            ..Default::default()
        };
        let mut driver = driver(channel);
        let schedule = SessionSchedule {
            session_id: Some("s9".to_string()),
            runs: vec![run(1), run(2)],
        };
        driver.run_session(&schedule).await.unwrap();

        let sent = events(&mut driver);
        assert_eq!(sent.first(), Some(&MsgEvent::StartSession));
        assert_eq!(sent.last(), Some(&MsgEvent::EndSession));
        assert_eq!(driver.identity().session_id, "s9");

        let (_, _, output) = driver.into_parts();
        assert_eq!(output.runs, vec![1, 2]);
        assert_eq!(output.predictions.len(), 6);
        assert_eq!(output.lines[0], "trial 1");
    }

    #[tokio::test]
    async fn cancelled_driver_sends_nothing() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut driver = driver(ScriptedChannel::default()).with_cancel(cancel);

        let result = driver.run_run(&run(1)).await;
        assert!(matches!(result, Err(RtError::Cancelled)));
        assert!(driver.channel_mut().sent.is_empty());
    }

    #[tokio::test]
    async fn base_model_session_writes_run_output() {
        let root = tempfile::tempdir().unwrap();
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        let (reply, _) = dispatcher.handle(&Message::init("base"));
        assert!(!reply.is_error());

        let mut driver = RunDriver::new(
            InProcess(dispatcher),
            ReplaySource,
            RunOutputDir::new(root.path()),
        );
        let schedule = SessionSchedule {
            session_id: Some("s9".to_string()),
            runs: vec![run(1), run(2)],
        };
        driver.run_session(&schedule).await.unwrap();

        let session = std::fs::read_to_string(root.path().join("session.txt")).unwrap();
        assert_eq!(session, "session s9 started\nsession s9 ended\n");

        let run1 =
            std::fs::read_to_string(root.path().join("run1").join("fileprocessing.txt")).unwrap();
        assert!(run1.starts_with("run 1 started, scan 3\n"));
        assert!(run1.contains("run 1 trained on (1,1) (1,2)\n"));
        assert!(run1.ends_with("run 1 ended after 3 trials\n"));

        let run2 =
            std::fs::read_to_string(root.path().join("run2").join("fileprocessing.txt")).unwrap();
        assert!(run2.contains("run 2 trained on (1,2) (2,1)\n"));
    }
}
