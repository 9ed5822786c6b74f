//! Bring a loader up on the simulated bus, run a reference run and drive it
//! from the tick scheduler.
//!
//! Run with: cargo run --example loader_demo

use std::sync::Arc;
use std::time::{Duration, Instant};

use labrig_core::config::{DeviceConfig, SchedulerConfig};
use labrig_devices::devices::loader::LoaderLogic;
use labrig_devices::events::FaultLog;
use labrig_devices::runtime::{Device, MainState};
use labrig_devices::scheduler::DeviceScheduler;
use labrig_modules::{
    AckKind, AckPayload, ModuleAck, ModuleBus, ModuleClass, ModuleRegistry, SimBus,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    labrig_core::init()?;

    let registry = Arc::new(ModuleRegistry::new());
    let motor = registry.register_module("loader.motor", ModuleClass::Motor);
    registry.register_module("loader.rfid", ModuleClass::Rfid);
    let bus = Arc::new(SimBus::new());

    let loader = Device::new(
        "loader-1",
        LoaderLogic::new(DeviceConfig::default()),
        Arc::clone(&registry),
        bus.clone() as Arc<dyn ModuleBus>,
        Arc::new(FaultLog::new()),
    );

    // Start -> Init -> Config -> Idle
    for _ in 0..3 {
        loader.tick(Instant::now());
    }
    assert_eq!(loader.main_state(), MainState::Idle);

    // Reference run: enable the driver stage, then home to the closed endpoint
    loader.reference_run()?;
    loader.tick(Instant::now());
    registry.dispatch_completion(&ModuleAck::ok(motor, AckKind::MotorState, AckPayload::None));
    loader.tick(Instant::now());
    registry.dispatch_completion(&ModuleAck::ok(
        motor,
        AckKind::MotorReferenceRun,
        AckPayload::MotorPosition(100),
    ));
    loader.tick(Instant::now());

    println!("drawer position after homing: {:?}", loader.drawer_position());
    println!("commands issued on the bus: {:?}", bus.issued());

    // Hand the device to the scheduler for continuous operation
    let scheduler = DeviceScheduler::new(&SchedulerConfig {
        tick_interval_ms: 50,
    });
    scheduler.register_device(Arc::new(loader.clone()));
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop().await;

    Ok(())
}
