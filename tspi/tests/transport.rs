// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Transport sessions against the simulated device, with and without a
//! meddling channel in between

use tspi::sim::{SimConfig, SimulatedTpm};
use tspi::{
    derive_auth, tpm_cap, Context, ContextConfig, DelegationTarget, Error, ErrorKind, KeyFlags,
    PolicyUsage, SecretMode, TpmCommand, TpmOrd, TransportState, Transmit,
};

const OWNER: &[u8] = b"owner";

fn device() -> SimulatedTpm {
    SimulatedTpm::with_config(SimConfig {
        owner_auth: derive_auth(SecretMode::Plain, OWNER).unwrap(),
        ..SimConfig::default()
    })
}

fn open(device: impl Transmit + 'static) -> Context {
    let mut ctx =
        Context::with_device(device, ContextConfig::default()).expect("Failed to open context");
    ctx.set_srk_secret_well_known().unwrap();
    let owner = ctx.owner_policy();
    ctx.set_secret(owner, SecretMode::Plain, OWNER).unwrap();
    ctx
}

fn capability(property: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmOrd::GetCapability);
    cmd.add_u32(tpm_cap::PROPERTY);
    cmd.add_u32(property);
    cmd.finalize()
}

/// Offset of the sequence number in an ExecuteTransport frame
const SEQ_OFFSET: usize = 14;

fn ordinal_of(frame: &[u8]) -> Option<TpmOrd> {
    let raw = frame.get(6..10)?;
    TpmOrd::from_u32(u32::from_be_bytes(raw.try_into().ok()?))
}

/// Shifts every transport sequence number before it reaches the device
struct Renumbering {
    inner: SimulatedTpm,
}

impl Transmit for Renumbering {
    fn transmit(&mut self, command: &[u8]) -> tspi::Result<Vec<u8>> {
        let mut frame = command.to_vec();
        if ordinal_of(&frame) == Some(TpmOrd::ExecuteTransport) {
            let seq = u32::from_be_bytes(frame[SEQ_OFFSET..SEQ_OFFSET + 4].try_into().unwrap());
            frame[SEQ_OFFSET..SEQ_OFFSET + 4].copy_from_slice(&(seq + 10).to_be_bytes());
        }
        self.inner.transmit(&frame)
    }
}

/// Delivers the previous wrapped command body in place of the current one
struct Replaying {
    inner: SimulatedTpm,
    previous: Option<Vec<u8>>,
}

impl Transmit for Replaying {
    fn transmit(&mut self, command: &[u8]) -> tspi::Result<Vec<u8>> {
        let mut frame = command.to_vec();
        if ordinal_of(&frame) == Some(TpmOrd::ExecuteTransport) {
            let body = frame[SEQ_OFFSET + 4..].to_vec();
            if let Some(earlier) = self.previous.replace(body) {
                frame.truncate(SEQ_OFFSET + 4);
                frame.extend_from_slice(&earlier);
            }
        }
        self.inner.transmit(&frame)
    }
}

#[test]
fn test_wrapped_signed_session() {
    let sim = device();
    let mut ctx = open(sim.clone());
    let session = ctx.begin_transport(true, true).unwrap();
    assert_eq!(ctx.active_transport(), Some(session));
    assert_eq!(ctx.transport_state(session).unwrap(), TransportState::Active);

    let srk = ctx.srk();
    let key = ctx.create_key_object(KeyFlags::bind());
    ctx.create_key(key, srk).unwrap();
    ctx.load_key(key, srk).unwrap();
    let host_log = ctx.transport_log(session).unwrap();

    let receipt = ctx.finalize_transport(session).unwrap();
    assert_eq!(receipt.commands, 2);
    assert_eq!(receipt.digest, host_log);
    assert_eq!(receipt.signature.len(), 32);
    assert_eq!(ctx.transport_state(session).unwrap(), TransportState::Finalized);
    assert_eq!(ctx.active_transport(), None);
    assert_eq!(sim.open_transport_count(), 0);

    let ordinals = sim.executed_ordinals();
    let wrapped = ordinals
        .iter()
        .position(|o| *o == TpmOrd::ExecuteTransport)
        .unwrap();
    assert_eq!(ordinals[wrapped + 1], TpmOrd::CreateWrapKey);

    let err = ctx
        .transport_execute(session, &capability(tpm_cap::PROP_MAX_KEYS))
        .unwrap_err();
    assert!(matches!(err, Error::SessionFinalized { .. }));
    assert!(ctx.finalize_transport(session).is_err());
}

#[test]
fn test_session_flavours() {
    let sim = device();
    let mut ctx = open(sim.clone());

    let err = ctx.begin_transport(false, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);

    let wrapped = ctx.begin_transport(true, false).unwrap();
    let err = ctx.begin_transport(false, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
    let response = ctx
        .transport_execute(wrapped, &capability(tpm_cap::PROP_DELEGATE_ROWS))
        .unwrap();
    assert_eq!(response.data, vec![0, 0, 0, 4, 0, 0, 0, 2]);
    let receipt = ctx.finalize_transport(wrapped).unwrap();
    assert!(receipt.signature.is_empty());

    let signed = ctx.begin_transport(false, true).unwrap();
    ctx.transport_execute(signed, &capability(tpm_cap::PROP_FAMILY_ROWS))
        .unwrap();
    let receipt = ctx.finalize_transport(signed).unwrap();
    assert_eq!(receipt.commands, 1);
    assert!(!receipt.signature.is_empty());
}

#[test]
fn test_renumbered_frames_fail_verification() {
    let sim = device();
    let mut ctx = open(Renumbering { inner: sim.clone() });
    let session = ctx.begin_transport(false, true).unwrap();
    ctx.transport_execute(session, &capability(tpm_cap::PROP_FAMILY_ROWS))
        .unwrap();
    ctx.transport_execute(session, &capability(tpm_cap::PROP_DELEGATE_ROWS))
        .unwrap();

    let err = ctx.finalize_transport(session).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
    assert_eq!(ctx.transport_state(session).unwrap(), TransportState::Finalized);
}

#[test]
fn test_replayed_frame_fails_verification() {
    let sim = device();
    let mut ctx = open(Replaying {
        inner: sim.clone(),
        previous: None,
    });
    let session = ctx.begin_transport(false, true).unwrap();
    let first = ctx
        .transport_execute(session, &capability(tpm_cap::PROP_FAMILY_ROWS))
        .unwrap();
    // The device answers the first command again
    let second = ctx
        .transport_execute(session, &capability(tpm_cap::PROP_DELEGATE_ROWS))
        .unwrap();
    assert_eq!(first.data, second.data);

    let err = ctx.finalize_transport(session).unwrap_err();
    assert!(matches!(err, Error::IntegrityFailure { .. }));
}

#[test]
fn test_abandon_and_close_release_device_session() {
    let sim = device();
    let mut ctx = open(sim.clone());
    let session = ctx.begin_transport(false, true).unwrap();
    assert_eq!(sim.open_transport_count(), 1);
    ctx.abandon_transport(session).unwrap();
    assert_eq!(sim.open_transport_count(), 0);
    assert_eq!(ctx.transport_state(session).unwrap(), TransportState::Finalized);

    ctx.begin_transport(true, false).unwrap();
    assert_eq!(sim.open_transport_count(), 1);
    ctx.close().unwrap();
    assert_eq!(sim.open_transport_count(), 0);
    assert_eq!(sim.loaded_key_count(), 0);
}

#[test]
fn test_failed_release_flushes_device_session() {
    let sim = device();
    let mut ctx = open(sim.clone());
    let session = ctx.begin_transport(false, true).unwrap();
    assert_eq!(sim.open_transport_count(), 1);

    let keys = ctx.config().transport.clone();
    let signer = ctx
        .load_key_by_uuid(keys.ps, keys.sign_key)
        .unwrap()
        .into_loaded()
        .unwrap();
    ctx.unload_key(signer).unwrap();

    let err = ctx.finalize_transport(session).unwrap_err();
    assert!(matches!(err, Error::NotLoaded { .. }));
    assert_eq!(ctx.transport_state(session).unwrap(), TransportState::Finalized);
    assert_eq!(ctx.active_transport(), None);
    assert_eq!(sim.open_transport_count(), 0);

    let flushes = sim.command_count();
    ctx.abandon_transport(session).unwrap();
    assert_eq!(sim.command_count(), flushes);
}

#[test]
fn test_delegation_under_transport() {
    let sim = device();
    let mut ctx = open(sim.clone());
    let delegate = ctx.create_policy(PolicyUsage::Usage);
    ctx.set_secret(delegate, SecretMode::Plain, b"operator")
        .unwrap();

    let session = ctx.begin_transport(true, true).unwrap();
    let family = ctx.create_family(3).unwrap();
    ctx.set_family_state(family, true).unwrap();
    let blob = ctx
        .create_delegation(family, delegate, DelegationTarget::Owner, 0x10, 0)
        .unwrap();
    ctx.cache(1, &blob, false).unwrap();
    let tables = ctx.read_tables().unwrap();
    let receipt = ctx.finalize_transport(session).unwrap();

    assert!(receipt.commands >= 6);
    let family_id = ctx.family_id(family).unwrap();
    assert!(tables.family(family_id).unwrap().enabled());
    assert_eq!(tables.row(1).unwrap().public, *blob.public());
    assert_eq!(sim.occupied_delegate_rows(), vec![1]);

    let ordinals = sim.executed_ordinals();
    let manage = ordinals
        .iter()
        .position(|o| *o == TpmOrd::DelegateManage)
        .unwrap();
    assert_eq!(ordinals[manage - 1], TpmOrd::ExecuteTransport);

    // Outside the session again
    ctx.invalidate(family).unwrap();
    assert_eq!(sim.live_family_count(), 0);
    assert!(sim.occupied_delegate_rows().is_empty());
}
