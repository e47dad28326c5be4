use stress_test::{stress_test_editing, stress_test_reconnects, stress_test_scaling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canop=info,canop_sync=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start the runtime: {}", e);
            std::process::exit(1);
        }
    };
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC CONVERGENCE STRESS TESTS                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: few editors, short sessions
    let stats = stress_test_editing(4, 100).await;
    stats.print();

    // Test 2: more editors, longer sessions
    let stats = stress_test_editing(10, 300).await;
    stats.print();

    // Test 3: editors dropping and rejoining mid-session
    let stats = stress_test_reconnects(6, 200, 40).await;
    stats.print();

    // Test 4: scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(16, 2).await;

    println!("\n✓ All stress tests completed successfully!");
}
