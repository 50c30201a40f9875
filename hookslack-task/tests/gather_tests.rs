// ABOUTME: Tests for gather and gather_results fan-in
// ABOUTME: Checks input ordering, fail-fast vs accumulate modes, and failure accounting

use hookslack_task::testing::MockHost;
use hookslack_task::{gather, gather_results, routine, Awaitable, HookEvent};

#[test]
fn test_gather_preserves_input_order() {
    let host = MockHost::new();
    let rt = host.runtime();
    let a = rt.hook_primitive(None);
    let b = rt.hook_primitive(None);
    let (a_id, b_id) = (a.id().to_string(), b.id().to_string());

    let r = rt.clone();
    let task = rt.spawn("fan-in", async move {
        let values = gather(
            &r,
            vec![
                Awaitable::from(a),
                Awaitable::from(b),
                routine(async { Ok(HookEvent::Fd { fd: 3 }) }),
            ],
        )
        .await?;
        Ok(values)
    });

    // Resolve in reverse order
    rt.dispatch(&b_id, HookEvent::Fd { fd: 2 });
    assert!(!task.is_done());
    rt.dispatch(&a_id, HookEvent::Fd { fd: 1 });

    assert_eq!(
        task.result().unwrap().unwrap(),
        vec![
            HookEvent::Fd { fd: 1 },
            HookEvent::Fd { fd: 2 },
            HookEvent::Fd { fd: 3 },
        ]
    );
}

#[test]
fn test_gather_accepts_running_tasks() {
    let host = MockHost::new();
    let rt = host.runtime();

    let r = rt.clone();
    let slow = rt.spawn("slow", async move {
        r.sleep(50).await?;
        Ok(1)
    });
    let fast = rt.spawn("fast", async { Ok(2) });

    let r = rt.clone();
    let task = rt.spawn("collect", async move {
        Ok(gather(&r, vec![Awaitable::from(slow), Awaitable::from(fast)]).await?)
    });
    assert!(!task.is_done());

    host.fire_last_timer(&rt).unwrap();
    assert_eq!(task.result().unwrap().unwrap(), vec![1, 2]);
}

#[test]
fn test_gather_results_returns_failures_in_place() {
    let host = MockHost::new();
    let rt = host.runtime();

    let r = rt.clone();
    let task = rt.spawn("accumulate", async move {
        let results = gather_results(
            &r,
            vec![
                routine(async { Ok(1) }),
                routine(async { Err(anyhow::anyhow!("second failed")) }),
                routine(async { Ok(3) }),
            ],
        )
        .await;
        Ok(results
            .into_iter()
            .map(|r| r.map_err(|e| e.to_string()))
            .collect::<Vec<_>>())
    });

    assert_eq!(
        task.result().unwrap().unwrap(),
        vec![Ok(1), Err("second failed".to_string()), Ok(3)]
    );
    assert!(rt.uncaught_errors().is_empty());
}

#[test]
fn test_gather_aborts_on_first_failure() {
    let host = MockHost::new();
    let rt = host.runtime();

    let r = rt.clone();
    let task = rt.spawn("fail-fast", async move {
        let outcome = gather(
            &r,
            vec![
                routine(async { Ok(1) }),
                routine(async { Err(anyhow::anyhow!("broken")) }),
                routine(async { Ok(3) }),
            ],
        )
        .await;
        Ok(match outcome {
            Ok(_) => String::new(),
            Err(e) => e.to_string(),
        })
    });

    assert_eq!(task.result().unwrap().unwrap(), "broken");
    assert!(rt.uncaught_errors().is_empty());
}

#[test]
fn test_gather_of_nothing_is_empty() {
    let host = MockHost::new();
    let rt = host.runtime();
    let r = rt.clone();
    let task = rt.spawn("empty", async move {
        Ok(gather(&r, Vec::<Awaitable<u8>>::new()).await?)
    });
    assert_eq!(task.result().unwrap().unwrap(), Vec::<u8>::new());
}
