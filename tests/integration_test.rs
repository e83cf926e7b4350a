use blockfs::descriptor::{DType, Extent3, VolumeDescriptorBuilder};
use blockfs::store::BlockStore;
use tempfile::tempdir;

#[test]
fn create_write_close_reopen_read() {
    let tmp = tempdir().unwrap();
    let descriptor = VolumeDescriptorBuilder::new(
        Extent3::new(512, 512, 512),
        Extent3::new(64, 64, 64),
        DType::U16,
        3,
    )
    .build()
    .unwrap();

    let index_path = tmp.path().join("volume.blockfs");
    let mut store = BlockStore::create(descriptor, &index_path).unwrap();

    let payload_a: Vec<u8> = (0u16..(64 * 64 * 64)).flat_map(u16::to_le_bytes).collect();
    let payload_b: Vec<u8> = vec![0x5Au8; 64 * 64 * 64 * 2];

    store.write_block(0, 0, 0, &payload_a).unwrap();
    store.write_block(64, 128, 256, &payload_b).unwrap();
    store.close().unwrap();

    drop(store);

    let reopened = BlockStore::open(&index_path).unwrap();
    assert_eq!(reopened.read_block(0, 0, 0).unwrap(), payload_a);
    assert_eq!(reopened.read_block(64, 128, 256).unwrap(), payload_b);

    // never-written coordinate reads back as zeros, not an error
    let zeros = reopened.read_block(128, 0, 0).unwrap();
    assert!(zeros.iter().all(|&b| b == 0));
}

#[test]
fn writes_across_several_shards_are_all_observable_after_close() {
    let tmp = tempdir().unwrap();
    let descriptor = VolumeDescriptorBuilder::new(
        Extent3::new(256, 256, 256),
        Extent3::new(64, 64, 64),
        DType::U8,
        4,
    )
    .build()
    .unwrap();
    let index_path = tmp.path().join("volume.blockfs");
    let mut store = BlockStore::create(descriptor, &index_path).unwrap();

    let coords: Vec<(u64, u64, u64)> = (0..4u64)
        .flat_map(|i| (0..4u64).map(move |j| (i, j)))
        .map(|(i, j)| (i * 64, j * 64, 0))
        .collect();

    for (idx, &(x, y, z)) in coords.iter().enumerate() {
        let payload = vec![idx as u8; 64 * 64 * 64];
        store.write_block(x, y, z, &payload).unwrap();
    }
    store.close().unwrap();

    for (idx, &(x, y, z)) in coords.iter().enumerate() {
        let data = store.read_block(x, y, z).unwrap();
        assert!(data.iter().all(|&b| b == idx as u8));
    }
}

#[test]
fn rebase_preserves_reads_after_moving_files() {
    let tmp = tempdir().unwrap();
    let descriptor = VolumeDescriptorBuilder::new(
        Extent3::new(256, 256, 256),
        Extent3::new(64, 64, 64),
        DType::U16,
        2,
    )
    .build()
    .unwrap();
    let index_path = tmp.path().join("volume.blockfs");
    let mut store = BlockStore::create(descriptor, &index_path).unwrap();

    let payload = vec![0x99u8; 64 * 64 * 64 * 2];
    store.write_block(0, 64, 128, &payload).unwrap();
    store.close().unwrap();

    let new_dir = tmp.path().join("relocated");
    store.rebase(&new_dir).unwrap();

    let reopened = BlockStore::open(store.index_path()).unwrap();
    assert_eq!(reopened.read_block(0, 64, 128).unwrap(), payload);
}

#[test]
fn boundary_block_at_volume_edge_roundtrips() {
    let tmp = tempdir().unwrap();
    let descriptor = VolumeDescriptorBuilder::new(
        Extent3::new(100, 100, 100),
        Extent3::new(64, 64, 64),
        DType::U8,
        1,
    )
    .build()
    .unwrap();
    let index_path = tmp.path().join("volume.blockfs");
    let mut store = BlockStore::create(descriptor, &index_path).unwrap();

    let (bz, by, bx) = store.get_block_size(64, 64, 64).unwrap();
    assert_eq!((bz, by, bx), (36, 36, 36));
    let payload = vec![0x7Eu8; (bz * by * bx) as usize];
    store.write_block(64, 64, 64, &payload).unwrap();
    store.close().unwrap();

    let data = store.read_block(64, 64, 64).unwrap();
    assert_eq!(data, payload);
}

#[test]
fn write_block_rejects_misaligned_coordinate() {
    let tmp = tempdir().unwrap();
    let descriptor = VolumeDescriptorBuilder::new(
        Extent3::new(256, 256, 256),
        Extent3::new(64, 64, 64),
        DType::U16,
        1,
    )
    .build()
    .unwrap();
    let index_path = tmp.path().join("volume.blockfs");
    let mut store = BlockStore::create(descriptor, &index_path).unwrap();
    let payload = vec![0u8; 64 * 64 * 64 * 2];
    assert!(store.write_block(1, 0, 0, &payload).is_err());
}

#[test]
fn check_reports_no_out_of_range_entries_for_a_healthy_store() {
    let tmp = tempdir().unwrap();
    let descriptor = VolumeDescriptorBuilder::new(
        Extent3::new(128, 128, 128),
        Extent3::new(64, 64, 64),
        DType::U8,
        2,
    )
    .build()
    .unwrap();
    let index_path = tmp.path().join("volume.blockfs");
    let mut store = BlockStore::create(descriptor, &index_path).unwrap();
    store.write_block(0, 0, 0, &vec![1u8; 64 * 64 * 64]).unwrap();
    store.write_block(64, 64, 64, &vec![2u8; 64 * 64 * 64]).unwrap();
    store.close().unwrap();

    let report = blockfs::check::check(&store).unwrap();
    assert!(report.is_healthy());
    assert_eq!(report.written_entries, 2);
}
