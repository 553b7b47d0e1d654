//! Randomized create/write/delete stress test, checking allocator and tree
//! consistency after a long run of mixed operations.

use nestfs::{Filesystem, MemStorage, OpenMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn mixed_workload_stays_consistent() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let mut fs = Filesystem::format(MemStorage::new()).unwrap();
    let mut live_files: Vec<String> = Vec::new();

    for step in 0..2000 {
        match rng.gen_range(0..4) {
            0 => {
                let name = format!("/f{step}");
                fs.create_file(&name).unwrap();
                live_files.push(name);
            }
            1 if !live_files.is_empty() => {
                let idx = rng.gen_range(0..live_files.len());
                let name = live_files.swap_remove(idx);
                let h = fs.open_file(&name, OpenMode::ReadWrite).unwrap();
                let len = rng.gen_range(0..6000);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                fs.write_file(&h, 0, &data).unwrap();
                fs.close_file(h).unwrap();
                live_files.push(name);
            }
            2 if !live_files.is_empty() => {
                let idx = rng.gen_range(0..live_files.len());
                let name = live_files.swap_remove(idx);
                fs.remove_file(&name).unwrap();
            }
            _ => {
                // no-op step, keeps the distribution from starving creates
            }
        }
    }

    fs.check().unwrap();
    for name in &live_files {
        assert!(fs.exists(name).unwrap());
    }
}
