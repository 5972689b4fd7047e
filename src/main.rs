use std::sync::Arc;

use log::info;

use strata::buffer::BufferPoolManager;
use strata::common::StorageConfig;
use strata::index::{BTreeConfig, BTreeIndex, IntegerComparator};
use strata::storage::disk::DiskManager;
use strata::{RecordId, Result, SlotId};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Strata - storage kernel demo");
    println!("============================\n");

    let config = StorageConfig::new("strata-demo").with_pool_size(16);
    config.validate()?;

    let disk_manager = Arc::new(DiskManager::new(&config.data_dir)?);
    println!("Data directory: {}", disk_manager.data_dir().display());

    let bpm = Arc::new(BufferPoolManager::with_config(&config, disk_manager.clone())?);
    println!(
        "Buffer pool: {} frames, LRU-{} replacement\n",
        bpm.pool_size(),
        config.lru_k
    );

    if disk_manager.is_file("demo.idx") {
        disk_manager.destroy_file("demo.idx")?;
    }
    disk_manager.create_file("demo.idx")?;
    let fd = disk_manager.open_file("demo.idx")?;

    let index = BTreeIndex::create(
        bpm.clone(),
        fd,
        BTreeConfig::new(4, Arc::new(IntegerComparator)).with_fanout(8),
    )?;

    for k in (0..200).rev() {
        let rid = RecordId::new(k as u32 / 10, SlotId::new((k % 10) as u16));
        index.insert(&(k as i32).to_le_bytes(), rid, None)?;
    }
    info!("inserted 200 keys");

    for k in (0..200).step_by(3) {
        index.remove(&(k as i32).to_le_bytes(), None)?;
    }
    info!("removed every third key");

    let stats = index.check_integrity()?;
    println!("Tree height: {}", stats.height);
    println!("Entries: {}", stats.num_entries);
    println!("Leaves: {}", stats.leaf_sizes.len());

    println!("\nKeys in [40, 60]:");
    for (key, rid) in index.range_scan(&40i32.to_le_bytes(), &60i32.to_le_bytes())? {
        let key = i32::from_le_bytes([key[0], key[1], key[2], key[3]]);
        println!("  - {} -> {}", key, rid);
    }

    bpm.flush_all_pages()?;
    println!(
        "\nDisk I/O: {} reads, {} writes",
        disk_manager.get_num_reads(),
        disk_manager.get_num_writes()
    );

    drop(index);
    drop(bpm);
    disk_manager.close_file(fd)?;
    disk_manager.destroy_file("demo.idx")?;

    println!("\nDemo completed successfully!");
    Ok(())
}
