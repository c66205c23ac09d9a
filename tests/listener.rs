mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;

use common::{encode_v1, encode_v2, payload};
use dynamic_proxy_header::listener::ProxiedListener;
use dynamic_proxy_header::{Endpoint, Version};

struct Case {
    name: String,
    header: Option<(Version, SocketAddr, SocketAddr)>,
    client_content: Vec<u8>,
    server_content: Vec<u8>,
}

fn cases() -> Vec<Case> {
    let v4: (SocketAddr, SocketAddr) = (
        "10.1.1.1:1000".parse().unwrap(),
        "20.2.2.2:2000".parse().unwrap(),
    );
    let v6: (SocketAddr, SocketAddr) = (
        "[ffff::ffff]:1000".parse().unwrap(),
        "[ffff::ffff]:2000".parse().unwrap(),
    );

    let mut cases = Vec::new();
    for (size, len) in [("small", 4), ("large", 4096)] {
        for (family, addrs) in [("ipv4", v4), ("ipv6", v6)] {
            for version in [Some(Version::V1), Some(Version::V2), None] {
                let name = match version {
                    Some(Version::V1) => "ppv1",
                    Some(Version::V2) => "ppv2",
                    None => "bypass",
                };
                cases.push(Case {
                    name: format!("{}/{}/{}", name, family, size),
                    header: version.map(|v| (v, addrs.0, addrs.1)),
                    client_content: if len == 4 { b"ping".to_vec() } else { payload(len) },
                    server_content: if len == 4 { b"pong".to_vec() } else { payload(len) },
                });
            }
        }
    }
    cases
}

fn encode(version: Version, source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    match version {
        Version::V1 => encode_v1(source, destination),
        Version::V2 => encode_v2(source, destination),
    }
}

#[test]
fn test_parse_remote_addr() {
    for case in cases() {
        let listener = ProxiedListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let header = case.header;
        let client_content = case.client_content.clone();
        let server_content = case.server_content.clone();

        let client = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            let local = client.local_addr().unwrap();

            if let Some((version, src, dst)) = header {
                client.write_all(&encode(version, src, dst)).unwrap();
            }
            client.write_all(&client_content).unwrap();

            let mut recv = vec![0u8; server_content.len()];
            client.read_exact(&mut recv).unwrap();
            assert_eq!(recv, server_content, "client received wrong content");

            local
        });

        let mut stream = listener.accept().unwrap();

        let mut recv = vec![0u8; case.client_content.len()];
        stream.read_exact(&mut recv).unwrap();
        assert_eq!(recv, case.client_content, "{}: server got wrong content", case.name);

        stream.write_all(&case.server_content).unwrap();

        let client_addr = client.join().unwrap();

        let remote = stream.remote_addr().unwrap();
        let local = stream.local_addr().unwrap();
        match case.header {
            Some((version, src, dst)) => {
                assert_eq!(remote, Endpoint::Inet(src), "{}", case.name);
                assert_eq!(local, Endpoint::Inet(dst), "{}", case.name);
                assert_eq!(stream.detection().unwrap().version(), Some(version));
            }
            None => {
                assert_eq!(remote, Endpoint::Inet(client_addr), "{}", case.name);
                assert_eq!(local, Endpoint::Inet(addr), "{}", case.name);
            }
        }
    }
}

#[test]
fn test_malformed_header() {
    let src: SocketAddr = "10.1.1.1:1000".parse().unwrap();
    let dst: SocketAddr = "20.2.2.2:2000".parse().unwrap();
    let src6: SocketAddr = "[ffff::ffff]:1000".parse().unwrap();
    let dst6: SocketAddr = "[ffff::ffff]:2000".parse().unwrap();

    let headers = [
        ("ppv1/ipv4", encode_v1(src, dst)),
        ("ppv1/ipv6", encode_v1(src6, dst6)),
        ("ppv2/ipv4", encode_v2(src, dst)),
        ("ppv2/ipv6", encode_v2(src6, dst6)),
    ];

    let listener = ProxiedListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    for (name, header) in headers {
        for i in 13..header.len() {
            let truncated = header[..i].to_vec();

            let client = thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                client.write_all(&truncated).unwrap();
                client.local_addr().unwrap()
            });

            let mut stream = listener.accept().unwrap();
            let client_addr = client.join().unwrap();

            let mut recv = Vec::new();
            stream.read_to_end(&mut recv).unwrap();
            assert_eq!(recv, &header[..i], "{}/{}", name, i);

            assert_eq!(stream.remote_addr().unwrap(), Endpoint::Inet(client_addr));
            assert!(stream.detection().unwrap().is_bypass(), "{}/{}", name, i);
        }
    }
}
