//! Tests for the publisher.

#[cfg(test)]
mod publisher_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::publisher::{Publisher, Subscriber};

    #[test]
    fn test_next_reaches_every_subscriber() {
        let publisher = Publisher::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let _a = {
            let total = total.clone();
            publisher.subscribe_fn(move |v| {
                total.fetch_add(v as usize, Ordering::SeqCst);
            })
        };
        let _b = {
            let total = total.clone();
            publisher.subscribe_fn(move |v| {
                total.fetch_add(v as usize, Ordering::SeqCst);
            })
        };

        assert_eq!(publisher.next(5), 2);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let publisher = Publisher::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let seen = seen.clone();
            publisher.subscribe_fn(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        publisher.next(1);
        subscription.unsubscribe();
        publisher.next(2);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    struct Recorder {
        completed: AtomicUsize,
        errors: AtomicUsize,
    }

    impl Subscriber<u32> for Recorder {
        fn next(&self, _value: u32) {}

        fn error(&self, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn complete(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_complete_notifies_and_closes() {
        let publisher = Publisher::<u32>::new();
        let recorder = Arc::new(Recorder {
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let _subscription = publisher.subscribe(recorder.clone());

        publisher.complete();
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.next(1), 0);

        // Late subscribers learn about completion immediately
        let _late = publisher.subscribe(recorder.clone());
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_notifies_subscribers() {
        let publisher = Publisher::<u32>::new();
        let recorder = Arc::new(Recorder {
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let _subscription = publisher.subscribe(recorder.clone());

        publisher.error("accept failed");
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
