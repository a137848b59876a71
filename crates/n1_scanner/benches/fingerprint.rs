use std::env;
use std::hint::black_box;
use std::time::Instant;

const DEFAULT_ITERATIONS: u64 = 100_000;

// `cargo bench --bench fingerprint -- 250_000`; cargo adds `--bench` itself.
fn iterations() -> Result<u64, String> {
    match env::args().skip(1).find(|arg| arg != "--bench") {
        None => Ok(DEFAULT_ITERATIONS),
        Some(arg) => match arg.replace('_', "").parse::<u64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(format!("invalid iterations value: {arg}")),
        },
    }
}

fn main() {
    let iterations = iterations().unwrap_or_else(|message| {
        eprintln!("{message}");
        std::process::exit(2);
    });

    let queries = [
        "SELECT `legs`.* FROM `legs` WHERE `legs`.`chair_id` = 123 ORDER BY `legs`.`id` ASC LIMIT 1",
        "SELECT * FROM foo WHERE bar IN (1, 2, 3) UNION SELECT * FROM foo WHERE bar IN (4, 5)",
        "INSERT INTO a_table (foo, bar) VALUES (1, 'aaa'), (2, 'bbb') /* batch */",
    ];

    let start = Instant::now();
    for i in 0..iterations {
        let query = queries[(i as usize) % queries.len()];
        let signature =
            n1_scanner::mysql_fingerprint(black_box(query)).expect("query should fingerprint");
        black_box(signature);
    }
    let elapsed = start.elapsed();
    let seconds = elapsed.as_secs_f64();
    let throughput = (iterations as f64) / seconds.max(f64::MIN_POSITIVE);

    println!("workload=mysql_fingerprint");
    println!("iterations={iterations}");
    println!("elapsed_seconds={seconds:.6}");
    println!("throughput_qps={throughput:.0}");
}
