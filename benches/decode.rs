use criterion::{criterion_group, criterion_main, Criterion};

use afpacket::decode::{decode, Protocol};

// A representative ether + ipv4 + udp frame with a 64 byte payload
fn udp_frame() -> Vec<u8> {
    let payload = [0xabu8; 64];

    let mut packet = vec![0u8; 14];
    packet[12] = 0x08;

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    let total = (20 + 8 + payload.len()) as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip[9] = 17;
    packet.extend_from_slice(&ip);

    let mut udp = [0u8; 8];
    let length = (8 + payload.len()) as u16;
    udp[4..6].copy_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&udp);

    packet.extend_from_slice(&payload);
    packet
}

fn test(c: &mut Criterion) {
    let packet = udp_frame();

    c.bench_function("decode_udp", |b| {
        b.iter(|| {
            let frame = decode(&packet, Protocol::Ether).unwrap();
            assert_eq!(frame.len(), 4);
        })
    });
}

criterion_group!(benches, test);
criterion_main!(benches);
