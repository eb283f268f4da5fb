// End-to-end TrustedCore command cycle against a scripted mock TZOS

use std::sync::{Arc, Mutex};

use teehost_core::mock_target::MockTarget;
use teehost_core::wire::WireStruct;
use teehost_core::TargetHandle;
use teehost_trustedcore::commands;
use teehost_trustedcore::factory::{TrustedCoreP9LiteFactory, TrustedCoreSession};
use teehost_trustedcore::structs::TcNsSmcCmd;
use teehost_trustedcore::{TC_SMC_NW_CALL, TC_SMC_RETURN_FROM_BOOT};

const SMC_ENTRY: u64 = 0x600;
const SHM_BASE: u64 = 0xE000_0000;
const ERET_ENTRY: u64 = 0x3620_8000;
// start of the outbound answer queue inside the shared-memory window
const OUTBOUND_QUEUE: u64 = SHM_BASE + 0x4 + 0x4 + 0x7DE;

fn session() -> (Arc<Mutex<MockTarget>>, TrustedCoreSession) {
    teehost_core::setup_logging();

    let mock = Arc::new(Mutex::new(MockTarget::new()));
    let handle: TargetHandle = mock.clone();
    let session = TrustedCoreP9LiteFactory::new()
        .with_exception_handler(None)
        .build(handle)
        .expect("session builds");

    // map only the ranges this test touches; the full board layout is
    // gigabytes of RAM
    {
        let mut mock = mock.lock().unwrap();
        for name in ["smc_handler_stub", "shared_mem", "temp_code_execution"] {
            let range = session.layout.find(name).expect(name);
            match &range.backing {
                Some(peripheral) => {
                    mock.map_peripheral(range.address, range.size, peripheral.clone());
                }
                None => mock.map_ram(range.address, range.size),
            }
        }
    }
    (mock, session)
}

fn boot(mock: &Arc<Mutex<MockTarget>>, session: &mut TrustedCoreSession) {
    mock.lock().unwrap().push_action(|cpu| {
        cpu.set_reg("x0", TC_SMC_RETURN_FROM_BOOT);
        cpu.set_reg("x1", ERET_ENTRY);
        cpu.set_reg("pc", SMC_ENTRY);
        Ok(())
    });
    let booted = session.runner.cont().expect("boot succeeds");
    assert!(booted.is_none());
    assert_eq!(session.context.tzos_eret_entrypoint(), Some(ERET_ENTRY));
}

#[test]
fn test_register_agent_round_trip() -> anyhow::Result<()> {
    let (mock, mut session) = session();
    boot(&mock, &mut session);

    // the global task consumes the staged slot and answers into the
    // outbound queue before switching worlds
    mock.lock().unwrap().push_action(|cpu| {
        let slot = cpu.read_mem(SHM_BASE + 0x4, TcNsSmcCmd::SIZE)?;
        let (mut request, _) = TcNsSmcCmd::parse(&slot).expect("staged command parses");
        assert_eq!(request.cmd_id, commands::TC_CMD_REGISTER_AGENT);

        request.ret_val = 0;
        request.context_id = 0x77;
        // answers are not required to land in the first slot
        let answer_address = OUTBOUND_QUEUE + 2 * TcNsSmcCmd::WIRE_SLOT_SIZE as u64;
        cpu.write_mem(answer_address, &request.to_bytes())?;

        cpu.set_reg("x0", TC_SMC_NW_CALL);
        cpu.set_reg("pc", SMC_ENTRY);
        Ok(())
    });

    let command = commands::register_agent(&mut session.shm_manager, 0x4B45, 0x5)?;
    let response = session.runner.execute_tzos_command(&command, false)?;
    assert_eq!(response.event_nr, 0x5);
    assert_eq!(response.context_id, 0x77);
    Ok(())
}
