//! Kernel scenario tests
//!
//! Each test drives a kernel over an in-memory store with scripted vats and
//! checks both what the vats saw and what the store holds afterwards.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{as_message, echo, init_tracing, resolve, Behavior, TestVatWorker};
use ocap_ipc::{
    kser, kser_with_slots, kslot, kunser, methargs, EndpointId, KRef, Resolution, VRef, VatConfig,
    VatDelivery, VatId, VatSyscall, VatSyscallResult,
};
use ocap_kernel::{
    ClusterConfig, Kernel, KernelError, KernelHandle, KernelOptions, PromiseSettlement,
};
use ocap_store::{KvStore, MemoryKvStore, RefCounts};
use serde_json::{json, Value};

fn v(n: u64) -> VatId {
    VatId::new(n)
}

async fn kernel_with(worker: TestVatWorker) -> Kernel<MemoryKvStore, TestVatWorker> {
    init_tracing();
    Kernel::make(MemoryKvStore::new(), worker, KernelOptions::default())
        .await
        .unwrap()
}

/// Launching a vat records its config and exports its root as `o+0`.
#[tokio::test]
async fn test_launch_vat() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;

    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();
    assert_eq!(root, KRef::object(1));

    let store = kernel.store();
    let endpoint = EndpointId::Vat(v(1));
    assert_eq!(store.get_owner(&root).unwrap(), Some(endpoint.clone()));
    assert_eq!(
        store.kref_to_eref(&endpoint, &root).unwrap(),
        Some("o+0".parse().unwrap())
    );
    // Root keeps its creation count
    assert_eq!(store.get_object_ref_count(&root).unwrap(), RefCounts::new(1, 1));
    assert_eq!(
        store.get_vat_config(&v(1)).unwrap(),
        Some(VatConfig::bundle_name("echo"))
    );

    let status = kernel.get_status().unwrap();
    assert_eq!(status.vats.len(), 1);
    assert_eq!(status.run_queue_length, 0);
}

/// A kernel message is delivered and its result comes back as data.
#[tokio::test]
async fn test_queue_message_resolves() {
    let worker = TestVatWorker::new().with_bundle("echo", echo);
    let log = worker.log();
    let mut kernel = kernel_with(worker).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();

    let rx = kernel.queue_message(root.clone(), "hello", vec![json!(1)]).unwrap();
    kernel.run_until_idle().await.unwrap();

    assert_eq!(
        rx.await.unwrap(),
        PromiseSettlement::Fulfilled(kser(&json!("hello-reply")))
    );
    assert_eq!(log.methods(&v(1)), vec!["hello".to_string()]);
    assert!(log.syscall_results(&v(1)).iter().all(VatSyscallResult::is_ok));

    // Result promise collected, root back to its pin
    let store = kernel.store();
    assert!(!store.kernel_ref_exists(&KRef::promise(1)));
    assert_eq!(store.get_object_ref_count(&root).unwrap(), RefCounts::new(1, 1));
    assert_eq!(store.clist_entries(&EndpointId::Vat(v(1))).unwrap().len(), 1);
}

/// Vat store mutations are persisted under `vs.<vat>.` after every delivery.
#[tokio::test]
async fn test_delivery_checkpoint_persisted() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();

    let _first = kernel.queue_message(root.clone(), "a", vec![]).unwrap();
    let _second = kernel.queue_message(root, "b", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();

    let kv = kernel.store().kv();
    assert_eq!(kv.get("vs.v1.deliveryCount").as_deref(), Some("2"));
    assert_eq!(
        kernel.store().get_vat_store(&v(1)),
        BTreeMap::from([("deliveryCount".to_string(), "2".to_string())])
    );
}

/// Messages to a terminated vat's objects splat with "no vat".
#[tokio::test]
async fn test_send_to_terminated_vat_splats() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();

    kernel.terminate_vat(&v(1), None).await.unwrap();
    assert!(kernel.vat_ids().is_empty());
    assert_eq!(kernel.store().get_owner(&root).unwrap(), None);
    assert_eq!(kernel.store().get_vat_config(&v(1)).unwrap(), None);

    let rx = kernel.queue_message(root, "hello", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();

    let settlement = rx.await.unwrap();
    assert!(settlement.is_rejected());
    assert_eq!(
        kunser(&settlement.data().body).unwrap(),
        json!({ "#error": "no vat", "name": "Error" })
    );
}

/// Messages sent to an unresolved promise wait on it, then follow its
/// resolution to the object it names, in the order they were sent.
#[tokio::test]
async fn test_promise_pipelining() {
    let pipeliner = || -> Behavior {
        let mut pending: Option<VRef> = None;
        Box::new(move |delivery: &VatDelivery| {
            let Some((method, _, slots, result)) = as_message(delivery) else {
                return Vec::new();
            };
            match method.as_str() {
                "getTarget" => {
                    pending = result;
                    Vec::new()
                }
                "resolveNow" => {
                    let mut resolutions = Vec::new();
                    if let Some(vpid) = pending.take() {
                        resolutions.push(Resolution::new(
                            vpid,
                            false,
                            kser_with_slots(&kslot(0, false, "target"), vec![slots[0].clone()]),
                        ));
                    }
                    if let Some(result) = result {
                        resolutions.push(Resolution::new(result, false, kser(&Value::Null)));
                    }
                    vec![VatSyscall::Resolve { resolutions }]
                }
                _ => Vec::new(),
            }
        })
    };
    let worker = TestVatWorker::new()
        .with_bundle("pipeliner", pipeliner)
        .with_bundle("echo", echo);
    let log = worker.log();
    let mut kernel = kernel_with(worker).await;
    let alice = kernel.launch_vat(VatConfig::bundle_name("pipeliner")).await.unwrap();
    let bob = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();

    // kp1 is the getTarget result, decided by alice but not yet resolved
    let target_rx = kernel.queue_message(alice.clone(), "getTarget", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();
    let kp1 = KRef::promise(1);
    assert_eq!(
        kernel.store().get_kernel_promise(&kp1).unwrap().decider,
        Some(EndpointId::Vat(v(1)))
    );

    let hello1 = kernel.queue_message(kp1.clone(), "hello1", vec![]).unwrap();
    let hello2 = kernel.queue_message(kp1.clone(), "hello2", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();
    assert_eq!(kernel.store().promise_queue_length(&kp1).unwrap(), 2);
    assert!(log.methods(&v(2)).is_empty());

    let done = kernel
        .queue_message_with_slots(
            alice,
            methargs("resolveNow", vec![kslot(0, false, "bob")], vec![bob.clone()]),
        )
        .unwrap();
    kernel.run_until_idle().await.unwrap();

    assert_eq!(log.methods(&v(2)), vec!["hello1".to_string(), "hello2".to_string()]);
    for delivery in log.deliveries(&v(2)) {
        let VatDelivery::Message { target, .. } = delivery else {
            panic!("expected a message");
        };
        assert_eq!(target.as_str(), "o+0");
    }
    assert_eq!(
        hello1.await.unwrap(),
        PromiseSettlement::Fulfilled(kser(&json!("hello1-reply")))
    );
    assert_eq!(
        hello2.await.unwrap(),
        PromiseSettlement::Fulfilled(kser(&json!("hello2-reply")))
    );
    assert_eq!(
        target_rx.await.unwrap(),
        PromiseSettlement::Fulfilled(kser_with_slots(&kslot(0, false, "target"), vec![bob]))
    );
    assert!(!done.await.unwrap().is_rejected());
    assert_eq!(kernel.store().run_queue_length().unwrap(), 0);
}

/// An export nobody references is dropped and then retired, and the kernel
/// object goes away.
#[tokio::test]
async fn test_unreferenced_export_is_collected() {
    let maker = || -> Behavior {
        Box::new(|delivery: &VatDelivery| match as_message(delivery) {
            Some((method, _, _, Some(result))) if method == "makeThing" => {
                vec![VatSyscall::Resolve {
                    resolutions: vec![Resolution::new(
                        result,
                        false,
                        kser_with_slots(&kslot(0, false, "thing"), vec!["o+1".parse().unwrap()]),
                    )],
                }]
            }
            _ => Vec::new(),
        })
    };
    let worker = TestVatWorker::new().with_bundle("maker", maker);
    let log = worker.log();
    let mut kernel = kernel_with(worker).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("maker")).await.unwrap();

    let rx = kernel.queue_message(root, "makeThing", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();

    let thing = KRef::object(2);
    let settlement = rx.await.unwrap();
    assert_eq!(settlement.data().slots, vec![thing.clone()]);

    let o1: VRef = "o+1".parse().unwrap();
    let gc: Vec<VatDelivery> = log
        .deliveries(&v(1))
        .into_iter()
        .filter(|d| !matches!(d, VatDelivery::Message { .. }))
        .collect();
    assert_eq!(
        gc,
        vec![
            VatDelivery::DropExports {
                vrefs: vec![o1.clone()],
            },
            VatDelivery::RetireExports { vrefs: vec![o1] },
        ]
    );

    let store = kernel.store();
    assert!(!store.kernel_ref_exists(&thing));
    assert!(!store.has_clist_entry(&EndpointId::Vat(v(1)), &thing));
    assert!(store.get_gc_actions().unwrap().is_empty());
}

/// A vat that exits with failure takes down the promises it was deciding.
#[tokio::test]
async fn test_vat_exit_rejects_decided_promises() {
    let quitter = || -> Behavior {
        Box::new(|delivery: &VatDelivery| match as_message(delivery) {
            Some((method, _, _, _)) if method == "quit" => vec![VatSyscall::Exit {
                is_failure: true,
                info: kser(&json!("bye")),
            }],
            _ => Vec::new(),
        })
    };
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("quitter", quitter)).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("quitter")).await.unwrap();

    let rx = kernel.queue_message(root, "quit", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();

    assert_eq!(rx.await.unwrap(), PromiseSettlement::Rejected(kser(&json!("bye"))));
    assert!(kernel.vat_ids().is_empty());
    assert_eq!(kernel.store().get_vat_store(&v(1)), BTreeMap::new());
}

/// An illegal syscall terminates the vat; a legacy syscall is only refused.
#[tokio::test]
async fn test_illegal_and_legacy_syscalls() {
    let misbehaving = || -> Behavior {
        Box::new(|delivery: &VatDelivery| match as_message(delivery) {
            Some((method, _, _, Some(result))) if method == "legacy" => vec![
                VatSyscall::VatstoreGet { key: "k".into() },
                resolve(result, json!("still here")),
            ],
            Some((method, _, _, _)) if method == "bad" => vec![VatSyscall::DropImports {
                vrefs: vec!["o+0".parse().unwrap()],
            }],
            _ => Vec::new(),
        })
    };
    let worker = TestVatWorker::new().with_bundle("misbehaving", misbehaving);
    let log = worker.log();
    let mut kernel = kernel_with(worker).await;
    let root = kernel
        .launch_vat(VatConfig::bundle_name("misbehaving"))
        .await
        .unwrap();

    let legacy = kernel.queue_message(root.clone(), "legacy", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();
    assert_eq!(
        legacy.await.unwrap(),
        PromiseSettlement::Fulfilled(kser(&json!("still here")))
    );
    assert_eq!(kernel.vat_ids(), vec![v(1)]);

    let bad = kernel.queue_message(root, "bad", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();
    let settlement = bad.await.unwrap();
    assert!(settlement.is_rejected());
    let reason = kunser(&settlement.data().body).unwrap();
    assert!(reason["#error"]
        .as_str()
        .unwrap()
        .starts_with("illegal syscall: "));
    assert!(kernel.vat_ids().is_empty());

    let results = log.syscall_results(&v(1));
    assert_eq!(results.len(), 3);
    assert!(!results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(!results[2].is_ok());
}

/// Bootstrap receives every root in vat-name order.
#[tokio::test]
async fn test_subcluster_bootstrap() {
    let roots_seen: Arc<Mutex<Vec<VRef>>> = Arc::default();
    let seen = Arc::clone(&roots_seen);
    let bootstrap = move || -> Behavior {
        let seen = Arc::clone(&seen);
        Box::new(move |delivery: &VatDelivery| match as_message(delivery) {
            Some((method, _, slots, Some(result))) if method == "bootstrap" => {
                *seen.lock().unwrap() = slots;
                vec![resolve(result, json!("ready"))]
            }
            _ => Vec::new(),
        })
    };
    let worker = TestVatWorker::new()
        .with_bundle("alice", bootstrap)
        .with_bundle("echo", echo);
    let mut kernel = kernel_with(worker).await;

    let config = ClusterConfig::from_json(
        r#"{
            "bootstrap": "alice",
            "vats": {
                "bob": { "bundleName": "echo" },
                "alice": { "bundleName": "alice" }
            }
        }"#,
    )
    .unwrap();
    let rx = kernel.launch_subcluster(config).await.unwrap().unwrap();
    kernel.run_until_idle().await.unwrap();

    assert_eq!(rx.await.unwrap(), PromiseSettlement::Fulfilled(kser(&json!("ready"))));
    // alice (v1) sees its own root as its export, bob's as an import
    assert_eq!(
        *roots_seen.lock().unwrap(),
        vec!["o+0".parse::<VRef>().unwrap(), "o-1".parse().unwrap()]
    );
    assert_eq!(kernel.vat_ids(), vec![v(1), v(2)]);
}

/// Reaping delivers bringOutYourDead to the selected vats only.
#[tokio::test]
async fn test_reap_vats() {
    let worker = TestVatWorker::new().with_bundle("echo", echo);
    let log = worker.log();
    let mut kernel = kernel_with(worker).await;
    kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();
    kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();

    kernel.reap_vats(|vat| vat == &v(2)).unwrap();
    kernel.run_until_idle().await.unwrap();

    assert!(log.deliveries(&v(1)).is_empty());
    assert_eq!(log.deliveries(&v(2)), vec![VatDelivery::BringOutYourDead]);
}

/// A kernel rebuilt from a persisted store relaunches its vats with their
/// stores and keeps every kernel record.
#[tokio::test]
async fn test_restart_from_persisted_store() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();
    let rx = kernel.queue_message(root.clone(), "hello", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();
    rx.await.unwrap();

    let image = kernel.shutdown().await.unwrap().to_json().unwrap();

    let worker = TestVatWorker::new().with_bundle("echo", echo);
    let log = worker.log();
    let mut kernel = Kernel::make(
        MemoryKvStore::from_json(&image).unwrap(),
        worker,
        KernelOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(kernel.vat_ids(), vec![v(1)]);
    assert_eq!(
        kernel.store().get_owner(&root).unwrap(),
        Some(EndpointId::Vat(v(1)))
    );
    assert_eq!(
        kernel.store().get_object_ref_count(&root).unwrap(),
        RefCounts::new(1, 1)
    );

    let rx = kernel.queue_message(root, "again", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();
    assert!(!rx.await.unwrap().is_rejected());
    assert_eq!(log.methods(&v(1)), vec!["again".to_string()]);
    assert_eq!(
        kernel.store().kv().get("vs.v1.deliveryCount").as_deref(),
        Some("2")
    );
}

/// Restarting a vat keeps its c-list and store.
#[tokio::test]
async fn test_restart_vat() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();
    let _ = kernel.queue_message(root.clone(), "one", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();

    kernel.restart_vat(&v(1)).await.unwrap();
    let rx = kernel.queue_message(root, "two", vec![]).unwrap();
    kernel.run_until_idle().await.unwrap();

    assert_eq!(
        rx.await.unwrap(),
        PromiseSettlement::Fulfilled(kser(&json!("two-reply")))
    );
    assert_eq!(kernel.store().get_vat_store(&v(1))["deliveryCount"], "2");
    assert!(matches!(
        kernel.restart_vat(&v(7)).await,
        Err(ocap_kernel::KernelError::VatNotFound(_))
    ));
}

/// Commands sent through a handle are served by the run loop.
#[tokio::test]
async fn test_kernel_handle_commands() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;
    let (handle, commands) = KernelHandle::channel();

    let driver = async move {
        let root = handle
            .launch_vat(VatConfig::bundle_name("echo"))
            .await
            .unwrap();
        let settlement = handle
            .queue_message(root, "hello", vec![])
            .await
            .unwrap();
        let status = handle.get_status().await.unwrap();
        (settlement, status)
    };

    let (run, (settlement, status)) = tokio::join!(kernel.run(commands), driver);
    run.unwrap();
    assert_eq!(
        settlement,
        PromiseSettlement::Fulfilled(kser(&json!("hello-reply")))
    );
    assert_eq!(status.vats.len(), 1);
    assert!(!kernel.store().kernel_ref_exists(&KRef::promise(1)));
}

/// Terminating a vat that never answers its delivery rejects the stuck
/// result and leaves the kernel serving other vats.
#[tokio::test]
async fn test_terminate_unresponsive_vat() {
    let worker = TestVatWorker::new()
        .with_silent_bundle("silent")
        .with_bundle("echo", echo);
    let log = worker.log();
    let mut kernel = kernel_with(worker).await;
    let (handle, commands) = KernelHandle::channel();

    let driver = async move {
        let silent = handle
            .launch_vat(VatConfig::bundle_name("silent"))
            .await
            .unwrap();
        let other = handle
            .launch_vat(VatConfig::bundle_name("echo"))
            .await
            .unwrap();
        let stuck = handle.queue_message(silent, "hello", vec![]);
        let terminate = async {
            while log.deliveries(&v(1)).is_empty() {
                tokio::task::yield_now().await;
            }
            handle.terminate_vat(v(1)).await
        };
        let (settlement, terminated) = tokio::join!(stuck, terminate);
        let after = handle.queue_message(other, "still", vec![]).await.unwrap();
        let status = handle.get_status().await.unwrap();
        (settlement.unwrap(), terminated, after, status)
    };

    let (run, (settlement, terminated, after, status)) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(kernel.run(commands), driver) },
    )
    .await
    .expect("kernel stopped serving commands");
    run.unwrap();

    terminated.unwrap();
    assert!(settlement.is_rejected());
    assert_eq!(
        kunser(&settlement.data().body).unwrap(),
        json!({ "#error": "vat terminated", "name": "Error" })
    );
    assert_eq!(
        after,
        PromiseSettlement::Fulfilled(kser(&json!("still-reply")))
    );
    assert_eq!(status.vats.len(), 1);
    assert_eq!(status.vats[0].id, v(2));
    assert_eq!(kernel.store().get_vat_config(&v(1)).unwrap(), None);
}

/// Kernel pins on result promises do not survive a rebuild from storage:
/// the promise is collected once it settles.
#[tokio::test]
async fn test_restart_releases_kernel_pins() {
    let mut kernel = kernel_with(TestVatWorker::new().with_bundle("echo", echo)).await;
    let root = kernel.launch_vat(VatConfig::bundle_name("echo")).await.unwrap();
    let rx = kernel.queue_message(root.clone(), "hello", vec![]).unwrap();
    let kp1 = KRef::promise(1);
    assert!(kernel.store().get_kernel_subscriptions().unwrap().contains(&kp1));

    // Shut down before the message is delivered
    let image = kernel.shutdown().await.unwrap().to_json().unwrap();
    assert!(rx.await.is_err());

    let worker = TestVatWorker::new().with_bundle("echo", echo);
    let log = worker.log();
    let mut kernel = Kernel::make(
        MemoryKvStore::from_json(&image).unwrap(),
        worker,
        KernelOptions::default(),
    )
    .await
    .unwrap();
    assert!(kernel.store().get_kernel_subscriptions().unwrap().is_empty());

    kernel.run_until_idle().await.unwrap();
    assert_eq!(log.methods(&v(1)), vec!["hello".to_string()]);
    assert!(!kernel.store().kernel_ref_exists(&kp1));
    assert_eq!(
        kernel.store().get_object_ref_count(&root).unwrap(),
        RefCounts::new(1, 1)
    );
}

/// A vat whose worker cannot start leaves no records behind.
#[tokio::test]
async fn test_failed_launch_leaves_nothing() {
    let mut kernel = kernel_with(TestVatWorker::new()).await;

    let err = kernel
        .launch_vat(VatConfig::bundle_name("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Config(_)));

    let store = kernel.store();
    assert!(kernel.vat_ids().is_empty());
    assert!(!store.kernel_ref_exists(&KRef::object(1)));
    assert_eq!(store.get_owner(&KRef::object(1)).unwrap(), None);
    assert_eq!(store.get_vat_config(&v(1)).unwrap(), None);
    assert!(store
        .clist_entries(&EndpointId::Vat(v(1)))
        .unwrap()
        .is_empty());
    assert_eq!(kernel.get_status().unwrap().gc_actions, 0);
}
