#![allow(dead_code)]

use std::net::SocketAddr;

use rtfmri::error::Result;
use rtfmri::ipc::{CommandDispatcher, MessageServer};
use rtfmri::model::ModelRegistry;
use rtfmri::run::schedule::{BlockGroupSchedule, BlockSchedule, TrialSchedule};
use rtfmri::run::{RunSchedule, SessionSchedule};
use tokio::task::JoinHandle;

/// Start a dispatcher on an ephemeral port. The task ends when a client
/// sends shutdown.
pub async fn spawn_dispatcher() -> (SocketAddr, JoinHandle<Result<()>>) {
    let mut server = MessageServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        dispatcher.serve(&mut server).await
    });
    (addr, handle)
}

/// A run with two block groups of `per_group` trials each, single block per
/// group, volumes numbered from 1.
pub fn test_run(run_id: u32, per_group: u32, replay: bool) -> RunSchedule {
    let mut vol = 0;
    let block_groups = (1..=2)
        .map(|blk_grp_id| BlockGroupSchedule {
            blk_grp_id,
            blocks: vec![BlockSchedule {
                block_id: 1,
                trials: (1..=per_group)
                    .map(|tr_id| {
                        vol += 1;
                        TrialSchedule {
                            tr_id,
                            vol,
                            data: replay.then(|| vec![vol as f64, 0.5]),
                        }
                    })
                    .collect(),
            }],
        })
        .collect();

    RunSchedule {
        run_id,
        scan_num: 5,
        disdaqs: 6,
        tr_time: 2,
        block_groups,
    }
}

pub fn test_session(runs: &[u32], per_group: u32) -> SessionSchedule {
    SessionSchedule {
        session_id: Some("test-session".to_string()),
        runs: runs.iter().map(|id| test_run(*id, per_group, true)).collect(),
    }
}
