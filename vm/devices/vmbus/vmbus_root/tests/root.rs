// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![expect(missing_docs)]

use efi_hv::HostVisibility;
use efi_hv::IsolationConfig;
use efi_hv::IsolationType;
use guestmem::GuestMemory;
use guestmem::PAGE_SIZE;
use guid::Guid;
use parking_lot::Mutex;
use std::sync::Arc;
use tpl::Dispatcher;
use tpl::Tpl;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::Version;
use vmbus_root::Channel;
use vmbus_root::DEFAULT_CLIENT_ID;
use vmbus_root::Error;
use vmbus_root::GpadlFlags;
use vmbus_root::RootState;
use vmbus_root::VmbusRoot;
use vmbus_root::VmbusRootConfig;
use vmbus_root::interface;
use vmbus_test_host::STATUS_UNSUCCESSFUL;
use vmbus_test_host::TestHost;
use vmbus_test_host::TestHostConfig;
use vmbus_test_host::make_offer;

const SHARED_GPA_BOUNDARY: u64 = 1 << 40;

struct TestEnv {
    dispatcher: Dispatcher,
    host: Arc<TestHost>,
    mem: GuestMemory,
    root: VmbusRoot,
}

fn setup(config: TestHostConfig, isolation: IsolationConfig) -> TestEnv {
    setup_with(config, isolation, VmbusRootConfig::default())
}

fn setup_with(
    config: TestHostConfig,
    isolation: IsolationConfig,
    root_config: VmbusRootConfig,
) -> TestEnv {
    test_with_tracing::init();
    let mem = GuestMemory::with_alias("test", 512, isolation.shared_alias());
    let host = TestHost::new(mem.clone(), config);
    let dispatcher = Dispatcher::new();
    dispatcher.add_interrupt_source(host.clone());
    let root = VmbusRoot::new(
        dispatcher.clone(),
        host.clone(),
        host.clone(),
        mem.clone(),
        isolation,
        root_config,
    );
    TestEnv {
        dispatcher,
        host,
        mem,
        root,
    }
}

fn with_offers(offers: impl IntoIterator<Item = (Guid, u32)>) -> TestHostConfig {
    TestHostConfig {
        offers: offers
            .into_iter()
            .map(|(id, channel_id)| make_offer(id, channel_id, OfferFlags::new()))
            .collect(),
        ..Default::default()
    }
}

fn isolated(isolation: IsolationType, paravisor_present: bool) -> IsolationConfig {
    IsolationConfig {
        isolation,
        paravisor_present,
        shared_gpa_boundary: SHARED_GPA_BOUNDARY,
        canonicalization_mask: 0,
    }
}

fn started(config: TestHostConfig) -> TestEnv {
    let env = setup(config, IsolationConfig::default());
    env.root.start().unwrap();
    env
}

fn zeroed() -> GpadlFlags {
    GpadlFlags::new().with_zero_pages(true)
}

fn create_gpadl(env: &TestEnv, channel: &Channel, pages: usize) -> vmbus_root::Gpadl {
    let buffer = env.mem.allocate_pages(pages).unwrap();
    let mut gpadl = channel
        .prepare_gpadl(buffer, pages * PAGE_SIZE, zeroed(), HostVisibility::READ_WRITE)
        .unwrap();
    channel.create_gpadl(&mut gpadl).unwrap();
    gpadl
}

#[test]
fn negotiates_copper_with_client_id() {
    let env = started(TestHostConfig::default());
    let version = env.root.version().unwrap();
    assert_eq!(version.version, Version::Copper);
    assert_eq!(
        version.feature_flags,
        FeatureFlags::new().with_client_id(true)
    );
    assert_eq!(env.root.state(), RootState::OffersDelivered);

    let contacts = env.host.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].client_id, Some(DEFAULT_CLIENT_ID));
    assert!(!contacts[0].confidential);
    assert_eq!(env.host.sint_connection(), Some(false));
    assert_eq!(
        env.host.posted_types(),
        [MessageType::INITIATE_CONTACT, MessageType::REQUEST_OFFERS]
    );
    assert_eq!(env.host.posted_messages()[0].len(), 56);
}

#[test]
fn falls_back_to_older_version() {
    let env = started(TestHostConfig {
        versions: vec![Version::Win8_1],
        ..Default::default()
    });
    let version = env.root.version().unwrap();
    assert_eq!(version.version, Version::Win8_1);
    assert_eq!(version.feature_flags, FeatureFlags::new());

    let contacts = env.host.contacts();
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[1].version, Version::Win8_1 as u32);
    assert_eq!(contacts[1].client_id, None);
    assert_eq!(contacts[1].feature_flags, FeatureFlags::new());
    assert_eq!(env.host.posted_messages()[1].len(), 40);
}

#[test]
fn no_supported_version() {
    let env = setup(
        TestHostConfig {
            versions: vec![Version::Win10],
            ..Default::default()
        },
        IsolationConfig::default(),
    );
    assert!(matches!(env.root.start(), Err(Error::UnsupportedVersion)));
    assert_eq!(env.root.state(), RootState::Failed);
    assert_eq!(env.host.sint_connection(), None);
    assert_eq!(env.host.contacts().len(), 2);
}

#[test]
fn connection_refused() {
    let env = setup(
        TestHostConfig {
            connection_state: ConnectionState::FAILED_LOW_RESOURCES,
            ..Default::default()
        },
        IsolationConfig::default(),
    );
    let err = env.root.start().unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionFailed(ConnectionState::FAILED_LOW_RESOURCES)
    ));
    // The refusal ends negotiation; older versions are not tried.
    assert_eq!(env.host.contacts().len(), 1);
    assert_eq!(env.root.state(), RootState::Failed);
    assert_eq!(env.host.sint_connection(), None);
}

#[test]
fn confidential_connection() {
    let env = setup(TestHostConfig::default(), isolated(IsolationType::Snp, true));
    env.root.start().unwrap();
    assert!(env.root.is_confidential());
    assert_eq!(env.host.sint_connection(), Some(true));
    let contacts = env.host.contacts();
    assert!(contacts[0].confidential);
    assert!(contacts[0].feature_flags.confidential_channels());
    assert!(
        env.root
            .version()
            .unwrap()
            .feature_flags
            .confidential_channels()
    );
}

#[test]
fn confidential_fallback() {
    let env = setup(
        TestHostConfig {
            fail_confidential_post: true,
            ..Default::default()
        },
        isolated(IsolationType::Snp, true),
    );
    env.root.start().unwrap();
    assert!(!env.root.is_confidential());
    assert_eq!(env.host.sint_connection(), Some(false));
    let contacts = env.host.contacts();
    assert_eq!(contacts.len(), 1);
    assert!(!contacts[0].confidential);
    assert!(!contacts[0].feature_flags.confidential_channels());
    assert!(contacts[0].feature_flags.client_id());

    // The fallback sticks across a restart.
    env.root.stop();
    env.host.update_config(|config| config.fail_confidential_post = false);
    env.root.start().unwrap();
    assert!(!env.root.is_confidential());
}

#[test]
fn leftover_messages_are_discarded() {
    let env = setup(with_offers([(interface::STORVSC, 1)]), IsolationConfig::default());
    env.host
        .send_message(OutgoingMessage::new(&protocol::AllOffersDelivered {}), false);
    env.root.start().unwrap();
    assert_eq!(env.root.channels().len(), 1);
}

#[test]
fn offers_are_filtered() {
    let env = started(with_offers([
        (interface::STORVSC, 1),
        (Guid::new_random(), 2),
        (interface::NETVSC, 3),
        (Guid::new_random(), 4),
        (Guid::new_random(), 5),
    ]));
    let ids: Vec<u32> = env.root.channels().iter().map(|c| c.channel_id()).collect();
    assert_eq!(ids, [1, 3]);
    assert_eq!(env.root.channel(3).unwrap().interface_id(), interface::NETVSC);
    assert!(env.root.channel(2).is_none());
}

#[test]
fn isolation_restricts_offers() {
    let offers = [
        (interface::STORVSC, 1),
        (interface::NETVSC, 2),
        (interface::VIDEO, 3),
        (interface::VMBFS, 4),
        (interface::SYNTHETIC_KEYBOARD, 5),
    ];

    let env = setup(with_offers(offers), isolated(IsolationType::Vbs, false));
    env.root.start().unwrap();
    let ids: Vec<u32> = env.root.channels().iter().map(|c| c.channel_id()).collect();
    assert_eq!(ids, [1, 2]);

    let env = setup_with(
        with_offers(offers),
        isolated(IsolationType::Snp, false),
        VmbusRootConfig {
            enable_imc_when_isolated: true,
            ..Default::default()
        },
    );
    env.root.start().unwrap();
    let ids: Vec<u32> = env.root.channels().iter().map(|c| c.channel_id()).collect();
    assert_eq!(ids, [1, 2, 4]);

    let env = started(with_offers(offers));
    assert_eq!(env.root.channels().len(), 5);
}

#[test]
fn pipe_and_confidential_offer_flags() {
    let mut config = TestHostConfig::default();
    config.offers = vec![
        make_offer(
            interface::VMBFS,
            1,
            OfferFlags::new()
                .with_named_pipe_mode(true)
                .with_confidential_ring_buffer(true)
                .with_confidential_external_memory(true),
        ),
        make_offer(
            interface::STORVSC,
            2,
            OfferFlags::new().with_confidential_ring_buffer(true),
        ),
    ];

    // Without the confidential feature the offer flags are ignored.
    let env = started(config.clone());
    let channel = env.root.channel(1).unwrap();
    assert!(channel.is_pipe_mode());
    assert!(!channel.is_confidential());
    assert!(!channel.uses_confidential_external_memory());

    let env = setup(config, isolated(IsolationType::Snp, true));
    env.root.start().unwrap();
    let channel = env.root.channel(1).unwrap();
    assert!(channel.is_confidential());
    assert!(channel.uses_confidential_external_memory());
    let channel = env.root.channel(2).unwrap();
    assert!(channel.is_confidential());
    assert!(!channel.is_pipe_mode());
    assert!(!channel.uses_confidential_external_memory());
}

#[test]
#[should_panic(expected = "already offered")]
fn duplicate_offer_fails() {
    let env = setup(
        with_offers([(interface::STORVSC, 1), (interface::NETVSC, 1)]),
        IsolationConfig::default(),
    );
    let _ = env.root.start();
}

#[test]
#[should_panic(expected = "out of range")]
fn offer_out_of_range_fails() {
    let env = setup(
        with_offers([(interface::STORVSC, 2048)]),
        IsolationConfig::default(),
    );
    let _ = env.root.start();
}

#[test]
fn hot_add() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let added = Arc::new(Mutex::new(Vec::new()));
    env.root.set_hot_add_handler({
        let added = added.clone();
        move |channel: Channel| added.lock().push(channel.channel_id())
    });

    env.host
        .offer_channel(make_offer(interface::NETVSC, 9, OfferFlags::new()));
    assert!(env.dispatcher.poll());
    assert_eq!(*added.lock(), [9]);
    assert!(env.root.channel(9).is_some());
    assert_eq!(env.dispatcher.current(), Tpl::APPLICATION);

    // A disallowed offer is consumed without a channel.
    env.host
        .offer_channel(make_offer(Guid::new_random(), 10, OfferFlags::new()));
    env.dispatcher.poll();
    assert_eq!(*added.lock(), [9]);
    assert!(env.root.channel(10).is_none());

    // The slot was released: later messages still flow.
    env.host
        .offer_channel(make_offer(interface::VPCI, 11, OfferFlags::new()));
    env.dispatcher.poll();
    assert_eq!(*added.lock(), [9, 11]);
}

#[test]
fn rescind_is_ignored() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    env.host.send_message(
        OutgoingMessage::new(&protocol::RescindChannelOffer {
            channel_id: ChannelId(1),
        }),
        false,
    );
    env.dispatcher.poll();
    assert!(env.root.channel(1).is_some());
    assert!(!env.host.posted_types().contains(&MessageType::REL_ID_RELEASED));

    let channel = env.root.channel(1).unwrap();
    let gpadl = create_gpadl(&env, &channel, 1);
    channel.destroy_gpadl(gpadl).unwrap();
}

#[test]
fn gpadl_handles_are_unique_and_reused() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();

    let a = create_gpadl(&env, &channel, 2);
    let b = create_gpadl(&env, &channel, 1);
    let c = create_gpadl(&env, &channel, 3);
    assert_eq!([a.handle(), b.handle(), c.handle()], [1, 2, 3]);
    assert_eq!(env.root.gpadl_count(), 3);

    let host_gpadl = env.host.gpadl(1).unwrap();
    assert_eq!(host_gpadl.channel_id, 1);
    assert_eq!(host_gpadl.range.byte_count as usize, 2 * PAGE_SIZE);
    assert_eq!(
        host_gpadl.pfns,
        [a.buffer() / PAGE_SIZE as u64, a.buffer() / PAGE_SIZE as u64 + 1]
    );

    channel.destroy_gpadl(b).unwrap();
    assert!(env.host.gpadl(2).is_none());
    let d = create_gpadl(&env, &channel, 1);
    assert_eq!(d.handle(), 2);

    for gpadl in [a, c, d] {
        channel.destroy_gpadl(gpadl).unwrap();
    }
    assert_eq!(env.root.gpadl_count(), 0);
    assert_eq!(env.host.gpadl_count(), 0);
}

#[test]
fn large_gpadl_uses_body_messages() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let gpadl = create_gpadl(&env, &channel, 60);

    let host_gpadl = env.host.gpadl(gpadl.handle()).unwrap();
    assert!(host_gpadl.is_complete());
    let first = gpadl.buffer() / PAGE_SIZE as u64;
    assert_eq!(host_gpadl.pfns, (first..first + 60).collect::<Vec<_>>());

    // 26 pages in the header, then 28 and 6.
    let types = env.host.posted_types();
    assert_eq!(
        types[2..],
        [
            MessageType::GPADL_HEADER,
            MessageType::GPADL_BODY,
            MessageType::GPADL_BODY
        ]
    );
    channel.destroy_gpadl(gpadl).unwrap();
}

#[test]
fn gpadl_parameters_are_validated() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let buffer = env.mem.allocate_pages(1).unwrap();
    let prepare = |buffer, len, flags| {
        channel.prepare_gpadl(buffer, len, flags, HostVisibility::READ_WRITE)
    };
    assert!(matches!(
        prepare(buffer, 0, zeroed()),
        Err(Error::InvalidParameter)
    ));
    assert!(matches!(
        prepare(buffer + 8, PAGE_SIZE, zeroed()),
        Err(Error::InvalidParameter)
    ));
    assert!(matches!(
        prepare(buffer, 100, zeroed()),
        Err(Error::InvalidParameter)
    ));
    assert!(matches!(
        prepare(buffer, PAGE_SIZE, GpadlFlags::from_bits(0x8)),
        Err(Error::InvalidParameter)
    ));

    let mut gpadl = prepare(buffer, PAGE_SIZE, zeroed()).unwrap();
    channel.create_gpadl(&mut gpadl).unwrap();
    assert!(matches!(
        channel.create_gpadl(&mut gpadl),
        Err(Error::InvalidParameter)
    ));
    channel.destroy_gpadl(gpadl).unwrap();
}

#[test]
fn prepare_zeroes_pages() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let buffer = env.mem.allocate_pages(1).unwrap();
    env.mem.fill_at(buffer, 0xcc, PAGE_SIZE).unwrap();

    let kept = channel
        .prepare_gpadl(buffer, PAGE_SIZE, GpadlFlags::new(), HostVisibility::READ_WRITE)
        .unwrap();
    let mut byte = [0];
    env.mem.read_at(buffer, &mut byte).unwrap();
    assert_eq!(byte, [0xcc]);
    channel.destroy_gpadl(kept).unwrap();

    let zeroed = channel
        .prepare_gpadl(buffer, PAGE_SIZE, zeroed(), HostVisibility::READ_WRITE)
        .unwrap();
    env.mem.read_at(buffer + 100, &mut byte).unwrap();
    assert_eq!(byte, [0]);
    channel.destroy_gpadl(zeroed).unwrap();
}

#[test]
fn gpadl_failure_releases_handle() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    env.host.update_config(|config| config.gpadl_status = -1);

    let buffer = env.mem.allocate_pages(1).unwrap();
    let mut gpadl = channel
        .prepare_gpadl(buffer, PAGE_SIZE, zeroed(), HostVisibility::READ_WRITE)
        .unwrap();
    assert!(matches!(
        channel.create_gpadl(&mut gpadl),
        Err(Error::OutOfResources)
    ));
    assert_eq!(gpadl.handle(), 0);
    assert_eq!(env.root.gpadl_count(), 0);

    env.host.update_config(|config| config.gpadl_status = 0);
    channel.create_gpadl(&mut gpadl).unwrap();
    assert_eq!(gpadl.handle(), 1);
    channel.destroy_gpadl(gpadl).unwrap();
}

#[test]
fn gpadl_table_full() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let buffer = env.mem.allocate_pages(1).unwrap();
    let mut gpadls = Vec::new();
    for _ in 1..vmbus_root::MAX_GPADLS {
        let mut gpadl = channel
            .prepare_gpadl(buffer, PAGE_SIZE, GpadlFlags::new(), HostVisibility::READ_WRITE)
            .unwrap();
        channel.create_gpadl(&mut gpadl).unwrap();
        gpadls.push(gpadl);
    }
    let mut gpadl = channel
        .prepare_gpadl(buffer, PAGE_SIZE, GpadlFlags::new(), HostVisibility::READ_WRITE)
        .unwrap();
    assert!(matches!(
        channel.create_gpadl(&mut gpadl),
        Err(Error::GpadlTableFull)
    ));

    let freed = gpadls.remove(40);
    let freed_handle = freed.handle();
    channel.destroy_gpadl(freed).unwrap();
    channel.create_gpadl(&mut gpadl).unwrap();
    assert_eq!(gpadl.handle(), freed_handle);
}

#[test]
fn isolated_gpadl_is_host_visible() {
    let env = setup(
        with_offers([(interface::STORVSC, 1)]),
        isolated(IsolationType::Snp, false),
    );
    env.root.start().unwrap();
    let channel = env.root.channel(1).unwrap();
    let buffer = env.mem.allocate_pages(2).unwrap();
    let mut gpadl = channel
        .prepare_gpadl(
            buffer,
            2 * PAGE_SIZE,
            zeroed().with_allow_encrypted(true),
            HostVisibility::READ_WRITE,
        )
        .unwrap();
    assert_eq!(env.host.visible_ranges(), [(buffer, 2 * PAGE_SIZE as u64)]);
    assert_eq!(gpadl.visible_address(), buffer + SHARED_GPA_BOUNDARY);
    assert_eq!(gpadl.buffer(), buffer + SHARED_GPA_BOUNDARY);
    assert_eq!(gpadl.allocated_buffer(), buffer);

    channel.create_gpadl(&mut gpadl).unwrap();
    assert_eq!(
        env.host.gpadl(gpadl.handle()).unwrap().pfns[0],
        (buffer + SHARED_GPA_BOUNDARY) / PAGE_SIZE as u64
    );
    channel.destroy_gpadl(gpadl).unwrap();
    assert!(env.host.visible_ranges().is_empty());
}

#[test]
fn confidential_channel_keeps_buffer_private() {
    let mut config = TestHostConfig::default();
    config.offers = vec![make_offer(
        interface::STORVSC,
        1,
        OfferFlags::new().with_confidential_ring_buffer(true),
    )];
    let env = setup(config, isolated(IsolationType::Snp, true));
    env.root.start().unwrap();
    let channel = env.root.channel(1).unwrap();
    let buffer = env.mem.allocate_pages(1).unwrap();

    let private = channel
        .prepare_gpadl(
            buffer,
            PAGE_SIZE,
            GpadlFlags::new().with_allow_encrypted(true),
            HostVisibility::READ_WRITE,
        )
        .unwrap();
    assert_eq!(private.buffer(), buffer);
    assert!(env.host.visible_ranges().is_empty());
    channel.destroy_gpadl(private).unwrap();

    let shared = channel
        .prepare_gpadl(buffer, PAGE_SIZE, GpadlFlags::new(), HostVisibility::READ_WRITE)
        .unwrap();
    assert_eq!(shared.buffer(), buffer + SHARED_GPA_BOUNDARY);
    assert_eq!(env.host.visible_ranges().len(), 1);
    channel.destroy_gpadl(shared).unwrap();
}

#[test]
fn visibility_failure() {
    let env = setup(
        TestHostConfig {
            fail_visibility: true,
            ..with_offers([(interface::STORVSC, 1)])
        },
        isolated(IsolationType::Vbs, false),
    );
    env.root.start().unwrap();
    let channel = env.root.channel(1).unwrap();
    let buffer = env.mem.allocate_pages(1).unwrap();
    assert!(matches!(
        channel.prepare_gpadl(buffer, PAGE_SIZE, zeroed(), HostVisibility::READ_WRITE),
        Err(Error::Hv(_))
    ));
}

#[test]
fn open_and_close() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let ring = create_gpadl(&env, &channel, 4);
    channel.open_channel(&ring, 2).unwrap();
    assert!(env.host.channel(1).is_some());

    channel.close_channel().unwrap();
    assert_eq!(env.host.closed_channels(), [1]);
    assert!(env.host.channel(1).is_none());
    channel.destroy_gpadl(ring).unwrap();
}

#[test]
fn open_failure() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    env.host
        .update_config(|config| config.open_status = STATUS_UNSUCCESSFUL);
    let channel = env.root.channel(1).unwrap();
    let ring = create_gpadl(&env, &channel, 4);
    assert!(matches!(
        channel.open_channel(&ring, 2),
        Err(Error::OutOfResources)
    ));
    channel.destroy_gpadl(ring).unwrap();
}

#[test]
fn interrupts_reach_registered_channels() {
    let env = started(with_offers([
        (interface::STORVSC, 1),
        (interface::NETVSC, 130),
    ]));
    let low = env.root.channel(1).unwrap();
    let high = env.root.channel(130).unwrap();
    let low_event = env.dispatcher.create_event(Tpl::APPLICATION, None);
    let high_event = env.dispatcher.create_event(Tpl::APPLICATION, None);
    low.register_isr(Some(low_event.clone()));
    high.register_isr(Some(high_event.clone()));

    env.host.signal_guest(130);
    env.host.signal_guest(1);
    env.dispatcher.poll();
    assert!(low_event.check());
    assert!(high_event.check());

    // Unregistering the highest channel stops scanning its flag word.
    high.register_isr(None);
    env.host.signal_guest(130);
    env.dispatcher.poll();
    assert!(!high_event.check());

    // An unregistered channel in a scanned word is dropped silently.
    low.register_isr(None);
    env.host.signal_guest(1);
    env.dispatcher.poll();
    assert!(!low_event.check());
}

#[test]
fn send_interrupt_signals_connection() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    channel.send_interrupt().unwrap();
    channel.send_interrupt().unwrap();
    assert_eq!(env.host.signal_count(channel.connection_id()), 2);
    assert_eq!(channel.connection_id(), 0x2001);
}

#[test]
fn stop_unloads_and_reclaims() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let _leaked = create_gpadl(&env, &channel, 1);

    env.root.stop();
    assert!(env.host.unloaded());
    assert_eq!(env.host.posted_types().last(), Some(&MessageType::UNLOAD));
    assert_eq!(env.host.sint_connection(), None);
    assert!(env.root.channels().is_empty());
    assert_eq!(env.root.gpadl_count(), 0);
    assert_eq!(env.root.state(), RootState::Disconnected);
    assert_eq!(env.root.version(), None);
}

#[test]
fn stop_without_unload_complete() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    env.host.update_config(|config| config.refuse_posts = true);
    env.root.stop();
    assert!(!env.host.unloaded());
    assert_ne!(env.host.posted_types().last(), Some(&MessageType::UNLOAD));
    assert_eq!(env.host.sint_connection(), None);
    assert!(env.root.channels().is_empty());
    assert_eq!(env.root.state(), RootState::Disconnected);
}

#[test]
fn stop_children() {
    let env = started(with_offers([
        (interface::STORVSC, 1),
        (interface::NETVSC, 2),
    ]));
    env.root.stop_children(&[1, 7]);
    assert!(env.root.channel(1).is_none());
    assert!(env.root.channel(2).is_some());
    assert!(!env.host.unloaded());
}

#[test]
fn exit_boot_services_unloads() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    let channel = env.root.channel(1).unwrap();
    let _orphan = create_gpadl(&env, &channel, 1);
    env.root.exit_boot_services();
    assert!(env.host.unloaded());
    // The orphan is reported, not reclaimed.
    assert_eq!(env.root.gpadl_count(), 1);
}

#[test]
#[should_panic(expected = "does not exist")]
fn open_result_for_unknown_channel_fails() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    env.host.send_message(
        OutgoingMessage::new(&protocol::OpenResult {
            channel_id: ChannelId(5),
            open_id: 0,
            status: 0,
        }),
        false,
    );
    env.dispatcher.poll();
}

#[test]
#[should_panic(expected = "is not allocated")]
fn gpadl_response_for_free_handle_fails() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    env.host.send_message(
        OutgoingMessage::new(&protocol::GpadlTorndown {
            gpadl_id: GpadlId(3),
        }),
        false,
    );
    env.dispatcher.poll();
}

#[test]
#[should_panic(expected = "out of range")]
fn gpadl_response_out_of_range_fails() {
    let env = started(with_offers([(interface::STORVSC, 1)]));
    env.host.send_message(
        OutgoingMessage::new(&protocol::GpadlCreated {
            channel_id: ChannelId(1),
            gpadl_id: GpadlId(vmbus_root::MAX_GPADLS as u32),
            status: 0,
        }),
        false,
    );
    env.dispatcher.poll();
}
