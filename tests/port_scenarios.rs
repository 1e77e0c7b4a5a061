//! End-to-end request scenarios against the simulator backend

use keyring_core::{decode_signature, SharedKeyring, WindowState};
use keyring_hardware_hal::simulator::SimulatedOp;
use keyring_hardware_hal::SimulatedHsm;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use tpm_keyring::protocol::*;
use tpm_keyring::{read_frame, serve, write_frame, Dispatcher, ServeOutcome};

const SEED: [u8; 32] = [0x42; 32];

struct Client {
    dispatcher: Dispatcher<SimulatedHsm>,
    next_id: u32,
}

impl Client {
    fn new() -> Self {
        Client {
            dispatcher: Dispatcher::new(SharedKeyring::new(SimulatedHsm::new(SEED))),
            next_id: 1,
        }
    }

    fn call(&mut self, op: u8, payload: &[u8]) -> Result<Vec<u8>, String> {
        let id = self.next_id.to_be_bytes();
        self.next_id += 1;

        let mut message = id.to_vec();
        message.push(op);
        message.extend_from_slice(payload);

        let dispatched = self.dispatcher.handle(&message).unwrap();
        let response = dispatched.response;
        assert_eq!(&response[..4], &id, "response must echo the request id");

        match response[4] {
            STATUS_OK => Ok(response[5..].to_vec()),
            STATUS_ERROR => Err(String::from_utf8(response[5..].to_vec()).unwrap()),
            other => panic!("bad status byte {}", other),
        }
    }

    fn public_key(&mut self, index: u16) -> Vec<u8> {
        self.call(OP_GET_PUBLIC_KEY, &index.to_be_bytes()).unwrap()
    }

    fn sign(&mut self, index: u16, digest: &[u8; 32], advance: bool) -> Vec<u8> {
        let mut payload = index.to_be_bytes().to_vec();
        payload.extend_from_slice(digest);
        payload.push(advance as u8);
        self.call(OP_SIGN_ECDSA, &payload).unwrap()
    }

    fn key_index(&mut self) -> u16 {
        let data = self.call(OP_GET_KEY_INDEX, &[]).unwrap();
        u16::from_be_bytes([data[0], data[1]])
    }
}

fn verify(encoded_key: &[u8], digest: &[u8; 32], encoded_signature: &[u8]) {
    let key = VerifyingKey::from_sec1_bytes(&encoded_key[26..91]).unwrap();
    let raw = decode_signature(encoded_signature).unwrap();
    let signature = Signature::from_scalars(raw.r, raw.s).unwrap();
    key.verify_prehash(digest, &signature).unwrap();
}

fn digest(message: &[u8]) -> [u8; 32] {
    Sha256::digest(message).into()
}

#[test]
fn test_single_use_signing_walkthrough() {
    let mut client = Client::new();
    client.call(OP_INITIALIZE, &1u16.to_be_bytes()).unwrap();
    assert_eq!(client.key_index(), 1);

    let root = client.public_key(0);
    let key1 = client.public_key(1);
    let key2 = client.public_key(2);
    assert_eq!(root.len(), 91);
    assert_ne!(key1, key2);

    let d1 = digest(b"first message");
    let sig1 = client.sign(1, &d1, true);
    assert!((70..=72).contains(&sig1.len()));
    verify(&key1, &d1, &sig1);
    assert_eq!(client.key_index(), 2);

    // The advanced window regenerates the same key 2 it handed out before.
    assert_eq!(client.public_key(2), key2);

    let d2 = digest(b"second message");
    let sig2 = client.sign(2, &d2, false);
    verify(&key2, &d2, &sig2);
    assert_eq!(client.key_index(), 2);

    let d0 = digest(b"root message");
    verify(&root, &d0, &client.sign(0, &d0, true));
    assert_eq!(client.key_index(), 2);
    assert_eq!(client.public_key(0), root);
}

#[test]
fn test_cold_keys_are_stable() {
    let mut client = Client::new();
    client.call(OP_INITIALIZE, &10u16.to_be_bytes()).unwrap();

    let cold = client.public_key(500);
    assert_eq!(client.public_key(500), cold);

    client.call(OP_SET_KEY_INDEX, &500u16.to_be_bytes()).unwrap();
    assert_eq!(client.key_index(), 500);
    assert_eq!(client.public_key(500), cold);

    let mut other = Client::new();
    other.call(OP_INITIALIZE, &1u16.to_be_bytes()).unwrap();
    assert_eq!(other.public_key(500), cold);
}

#[test]
fn test_ecdh_agrees_with_peer() {
    let mut client = Client::new();
    client.call(OP_INITIALIZE, &1u16.to_be_bytes()).unwrap();

    let peer_secret = SecretKey::from_slice(&[0x17; 32]).unwrap();
    let peer_point = peer_secret.public_key().to_encoded_point(false);

    for index in [0u16, 1, 2, 77] {
        let mut payload = index.to_be_bytes().to_vec();
        payload.extend_from_slice(peer_point.as_bytes());
        let shared = client.call(OP_GET_ECDH_POINT, &payload).unwrap();

        let ours = PublicKey::from_sec1_bytes(&client.public_key(index)[26..91]).unwrap();
        let expected = (ours.to_projective() * *peer_secret.to_nonzero_scalar())
            .to_affine()
            .to_encoded_point(false);
        assert_eq!(shared, expected.as_bytes(), "index {}", index);
    }
}

#[test]
fn test_input_errors_are_recoverable() {
    let mut client = Client::new();
    assert_eq!(
        client.call(OP_GET_KEY_INDEX, &[]).unwrap_err(),
        "Key window not initialized"
    );

    client.call(OP_INITIALIZE, &1u16.to_be_bytes()).unwrap();
    assert_eq!(
        client.call(OP_SIGN_ECDSA, &[0x00, 0x01]).unwrap_err(),
        "missing digest"
    );
    assert_eq!(
        client.call(0x99, &[]).unwrap_err(),
        "unknown operation"
    );

    let mut bad_peer = 1u16.to_be_bytes().to_vec();
    bad_peer.push(0x04);
    bad_peer.extend_from_slice(&[0x01; 64]);
    assert!(client.call(OP_GET_ECDH_POINT, &bad_peer).is_err());

    assert_eq!(client.key_index(), 1);
}

#[test]
fn test_node_seed_is_stable() {
    let mut client = Client::new();
    client.call(OP_INITIALIZE, &1u16.to_be_bytes()).unwrap();

    let seed = client.call(OP_RETRIEVE_NODE_SEED, &[]).unwrap();
    assert_eq!(seed.len(), 32);

    // Re-initializing must not overwrite the provisioned seed.
    client.call(OP_INITIALIZE, &5u16.to_be_bytes()).unwrap();
    assert_eq!(client.call(OP_RETRIEVE_NODE_SEED, &[]).unwrap(), seed);
}

#[test]
fn test_fatal_error_stops_the_port() {
    let keyring = SharedKeyring::new(SimulatedHsm::new(SEED));
    keyring.initialize(1).unwrap();
    keyring
        .with_manager(|manager| {
            manager.hsm_mut().inject_failure(SimulatedOp::Sign);
            Ok(())
        })
        .unwrap();
    let dispatcher = Dispatcher::new(keyring);

    let mut sign = vec![0, 0, 0, 9, OP_SIGN_ECDSA, 0x00, 0x01];
    sign.extend_from_slice(&[0x33; 32]);

    let mut input = Vec::new();
    write_frame(&mut input, &sign).unwrap();
    write_frame(&mut input, &[0, 0, 0, 10, OP_GET_KEY_INDEX]).unwrap();

    let mut output = Vec::new();
    let outcome = serve(&dispatcher, &mut Cursor::new(input), &mut output).unwrap();
    assert_eq!(outcome, ServeOutcome::Fatal);

    let mut responses = Cursor::new(output);
    let response = read_frame(&mut responses).unwrap().unwrap();
    assert_eq!(&response[..5], &[0, 0, 0, 9, STATUS_ERROR]);
    assert!(read_frame(&mut responses).unwrap().is_none());

    assert_eq!(dispatcher.keyring().state(), WindowState::Faulted);
}
