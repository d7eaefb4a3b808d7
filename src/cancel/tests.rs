//! Tests for cancellation sources, tokens, composition and operations.

#[cfg(test)]
mod cancel_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time;

    use crate::cancel::{
        compose_cancellation_token, start_operation, CancelCallback, CancellationSource, CancellationToken,
        OperationError, Registration, StopReason,
    };
    use crate::server::StatusCode;

    #[test]
    fn test_callbacks_fire_once_in_registration_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3 {
            let calls = calls.clone();
            token.on_cancel(move |reason| calls.lock().push((index, reason.clone())));
        }

        source.cancel(StopReason::requested("first"));
        source.cancel(StopReason::requested("second"));

        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        for (position, (index, reason)) in calls.iter().enumerate() {
            assert_eq!(*index, position);
            assert_eq!(*reason, StopReason::requested("first"));
        }
    }

    #[test]
    fn test_second_cancel_keeps_first_reason() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancellation_requested());

        source.cancel(StopReason::requested("first"));
        source.cancel(StopReason::InternalError("boom".to_string()));

        assert!(token.is_cancellation_requested());
        assert_eq!(token.reason(), Some(StopReason::requested("first")));
    }

    #[test]
    fn test_same_callback_registered_twice_fires_once() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));

        let callback: CancelCallback = {
            let count = count.clone();
            Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        token.register(callback.clone());
        token.register(callback);
        assert_eq!(token.callback_count(), 1);

        source.cancel(StopReason::Unspecified);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_removes_callback() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));

        let registration = {
            let count = count.clone();
            token.on_cancel(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        registration.unregister();

        source.cancel(StopReason::Unspecified);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_during_delivery_does_not_perturb_others() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));
        let later: Arc<Mutex<Option<Registration>>> = Arc::new(Mutex::new(None));

        {
            let later = later.clone();
            let count = count.clone();
            token.on_cancel(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(registration) = later.lock().take() {
                    registration.unregister();
                }
            });
        }
        let registration = {
            let count = count.clone();
            token.on_cancel(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        *later.lock() = Some(registration);

        source.cancel(StopReason::Unspecified);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let source = CancellationSource::new();
        source.cancel(StopReason::ClientAborted);

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            source.token().on_cancel(move |reason| *seen.lock() = Some(reason.clone()));
        }
        assert_eq!(*seen.lock(), Some(StopReason::ClientAborted));
    }

    #[test]
    fn test_throw_if_requested() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(token.throw_if_requested().is_ok());

        source.cancel(StopReason::requested("done"));
        let error = token.throw_if_requested().unwrap_err();
        assert_eq!(error.reason, StopReason::requested("done"));
    }

    #[test]
    fn test_termination_status_by_reason() {
        assert_eq!(StopReason::InternalError("x".into()).termination_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(StopReason::requested("bye").termination_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(StopReason::Unspecified.termination_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cancelled_resolves_with_reason() {
        let source = CancellationSource::new();
        let token = source.token();

        let waiter = tokio::spawn(async move { token.cancelled().await });
        time::sleep(Duration::from_millis(10)).await;
        source.cancel(StopReason::requested("wake"));

        let reason = time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(reason, StopReason::requested("wake"));
    }

    #[test]
    fn test_composed_token_follows_either_constituent() {
        for cancel_first in [true, false] {
            let a = CancellationSource::new();
            let b = CancellationSource::new();
            let composed = compose_cancellation_token(&[a.token(), b.token()]);
            let count = Arc::new(AtomicUsize::new(0));
            {
                let count = count.clone();
                composed.on_cancel(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }

            if cancel_first {
                a.cancel(StopReason::requested("a"));
                b.cancel(StopReason::requested("b"));
                assert_eq!(composed.reason(), Some(StopReason::requested("a")));
            } else {
                b.cancel(StopReason::requested("b"));
                a.cancel(StopReason::requested("a"));
                assert_eq!(composed.reason(), Some(StopReason::requested("b")));
            }

            assert!(composed.is_cancellation_requested());
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_composed_token_unregisters_from_all_once_fired() {
        let a = CancellationSource::new();
        let b = CancellationSource::new();
        let composed = compose_cancellation_token(&[a.token(), b.token()]);
        assert_eq!(b.token().callback_count(), 1);

        a.cancel(StopReason::ClientAborted);
        assert_eq!(b.token().callback_count(), 0);
        assert!(composed.is_cancellation_requested());
    }

    #[test]
    fn test_dropping_composed_token_releases_registrations() {
        let server = CancellationSource::new();
        for _ in 0..10 {
            let request = CancellationSource::new();
            let composed = compose_cancellation_token(&[server.token(), request.token()]);
            assert!(!composed.is_cancellation_requested());
        }
        assert_eq!(server.token().callback_count(), 0);
    }

    #[test]
    fn test_composed_with_already_cancelled_constituent() {
        let a = CancellationSource::new();
        a.cancel(StopReason::requested("early"));
        let composed = compose_cancellation_token(&[CancellationToken::none(), a.token()]);
        assert_eq!(composed.reason(), Some(StopReason::requested("early")));
    }

    #[tokio::test]
    async fn test_operation_stop_runs_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::none();

        let operation = {
            let stops = stops.clone();
            start_operation(&token, async { Ok::<_, ()>(42) }, move |value: u32| async move {
                assert_eq!(value, 42);
                stops.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap()
        };

        assert_eq!(*operation.value(), 42);
        tokio::join!(operation.stop(), operation.stop());
        operation.stop().await;
        assert!(operation.is_stopped());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_operation_still_releases_start_value() {
        let source = CancellationSource::new();
        let token = source.token();
        let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel();

        let pending = {
            let token = token.clone();
            tokio::spawn(async move {
                start_operation(
                    &token,
                    async {
                        time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ()>("socket")
                    },
                    move |value: &'static str| async move {
                        let _ = stopped_tx.send(value);
                    },
                )
                .await
            })
        };

        time::sleep(Duration::from_millis(10)).await;
        source.cancel(StopReason::requested("abort start"));

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(OperationError::Cancelled(ref e)) if e.reason == StopReason::requested("abort start")));

        let released = time::timeout(Duration::from_secs(1), stopped_rx).await.unwrap().unwrap();
        assert_eq!(released, "socket");
    }

    #[tokio::test]
    async fn test_operation_on_cancelled_token_never_starts() {
        let source = CancellationSource::new();
        source.cancel(StopReason::Unspecified);
        let started = Arc::new(AtomicUsize::new(0));

        let result = {
            let started = started.clone();
            start_operation(
                &source.token(),
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(())
                },
                |_| async {},
            )
            .await
        };

        assert!(matches!(result, Err(OperationError::Cancelled(_))));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operation_start_failure() {
        let result = start_operation(
            &CancellationToken::none(),
            async { Err::<u8, _>("bind failed") },
            |_| async {},
        )
        .await;
        assert!(matches!(result, Err(OperationError::Failed("bind failed"))));
    }

    #[tokio::test]
    async fn test_operation_stops_when_token_fires_later() {
        let source = CancellationSource::new();
        let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel();

        let operation = start_operation(&source.token(), async { Ok::<_, ()>(7u8) }, move |value| async move {
            let _ = stopped_tx.send(value);
        })
        .await
        .unwrap();
        assert!(!operation.is_stopped());

        source.cancel(StopReason::requested("later"));
        let released = time::timeout(Duration::from_secs(1), stopped_rx).await.unwrap().unwrap();
        assert_eq!(released, 7);

        // An explicit stop afterwards shares the completed run
        operation.stop().await;
        assert!(operation.is_stopped());
    }
}
