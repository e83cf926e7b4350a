use criterion::{black_box, criterion_group, criterion_main, Criterion};
use blockfs::codec::{Codec, Lz4Codec, NoneCodec, ZstdCodec};

// One 64^3 uint16 block, the store's own default block size/dtype.
const BLOCK_VOXELS: usize = 64 * 64 * 64;

fn bench_compression(c: &mut Criterion) {
    let data = vec![0u8; BLOCK_VOXELS * 2];
    let zstd = ZstdCodec;
    let lz4 = Lz4Codec;
    let none = NoneCodec;

    c.bench_function("zstd_compress_block", |b| b.iter(|| zstd.compress(black_box(&data), 3)));
    c.bench_function("lz4_compress_block", |b| b.iter(|| lz4.compress(black_box(&data), 0)));
    c.bench_function("none_compress_block", |b| b.iter(|| none.compress(black_box(&data), 0)));

    let zstd_compressed = zstd.compress(&data, 3).unwrap();
    let lz4_compressed = lz4.compress(&data, 0).unwrap();
    c.bench_function("zstd_decompress_block", |b| b.iter(|| zstd.decompress(black_box(&zstd_compressed))));
    c.bench_function("lz4_decompress_block", |b| b.iter(|| lz4.decompress(black_box(&lz4_compressed))));
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
