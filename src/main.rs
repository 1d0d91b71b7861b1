use amq_bench::{
    addresser::AddressingMode, batch::BatchWidth, log, CuckooFilter, FilterConfig, Layout,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn main() {
    log::init_logger();
    let n = 1_000_000usize;
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let keys: Vec<u64> = (0..n).map(|_| rng.random()).collect();
    let probes: Vec<u64> = (0..10 * n).map(|_| rng.random()).collect();

    for (name, layout) in [("standard", Layout::Standard), ("block", Layout::block())] {
        let config = FilterConfig {
            layout,
            addressing: AddressingMode::Lemire,
            partitions: 64,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            batch: BatchWidth::X8,
            ..FilterConfig::default()
        };
        let mut filter = match CuckooFilter::<u64>::new(config) {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("{}: {}", name, e);
                continue;
            }
        };
        if !filter.construct(&keys) {
            eprintln!("{}: construction failed after {} retries", name, filter.retries());
            continue;
        }
        let hits = filter.count(&keys);
        let false_positives = filter.count(&probes);
        println!(
            "{}: size = {} bytes, load = {:.3}, retries = {}, hits = {}/{}, fpr = {:.5}",
            name,
            filter.size(),
            filter.load(),
            filter.retries(),
            hits,
            n,
            false_positives as f64 / probes.len() as f64
        );
    }
}
