//! Integration tests for the thread lifecycle and the sync primitives.

#[cfg(test)]
mod lifecycle_tests {
    use crate::arch::{Arch, InterruptLevel};
    use crate::arch::host::HostArch;
    use crate::config::PAGE_SIZE;
    use crate::errors::SpawnError;
    use crate::mem::PagePool;
    use crate::sched::{priority, SchedulerStats};
    use crate::tests::helpers::{boot_kernel, boot_kernel_with, run_until_count, EventLog};
    use crate::thread::ThreadState;
    use alloc::vec::Vec;

    #[test]
    fn test_init_adopts_boot_thread() {
        let kernel = boot_kernel();

        let main = kernel.current();
        assert_eq!(main.id().get(), 1);
        assert_eq!(kernel.current_name().as_str(), "main");
        assert_eq!(main.state(), ThreadState::Running);
        assert_eq!(kernel.priority(), priority::DEFAULT);
        assert!(main.owns_address(HostArch::stack_pointer()));
        assert_eq!(kernel.thread_count(), 1);
    }

    #[test]
    fn test_create_does_not_preempt() {
        let kernel = boot_kernel();
        let log = EventLog::new();

        for name in ["a", "b"] {
            let log = log.clone();
            kernel
                .spawn(name, priority::DEFAULT, move || log.push(name))
                .unwrap();
        }

        assert!(log.events().is_empty());
        assert_eq!(kernel.ready_count(), 2);
        assert_eq!(kernel.thread_count(), 3);

        kernel.yield_now();

        assert_eq!(log.events(), ["a", "b"]);
        assert_eq!(kernel.thread_count(), 1);
        assert_eq!(
            kernel.scheduler_stats(),
            SchedulerStats {
                enqueued: 3,
                dequeued: 3,
                queued: 0
            }
        );
    }

    #[test]
    fn test_two_counters_each_complete_once() {
        let kernel = boot_kernel();
        let log = EventLog::new();

        for (name, priority, limit) in [("A", 10u8, 10u32), ("B", 20u8, 20u32)] {
            let log = log.clone();
            kernel
                .spawn(name, priority, move || {
                    let mut count = 0;
                    while count < limit {
                        count += 1;
                    }
                    assert_eq!(count, limit);
                    log.push(name);
                })
                .unwrap();
        }

        let created = kernel.scheduler_stats();
        assert_eq!((created.enqueued, created.dequeued), (2, 0));

        run_until_count(kernel, 1);
        assert_eq!(log.events(), ["A", "B"]);
        assert_eq!(kernel.stats().threads_reaped, 2);

        // A and B are dequeued once each; main's single yield is the only other entry
        assert_eq!(
            kernel.scheduler_stats(),
            SchedulerStats {
                enqueued: 3,
                dequeued: 3,
                queued: 0
            }
        );
    }

    #[test]
    fn test_yield_interleaves_in_fifo_order() {
        let kernel = boot_kernel();
        let log = EventLog::new();

        for (name, steps) in [("a", ["a0", "a1", "a2"]), ("b", ["b0", "b1", "b2"])] {
            let log = log.clone();
            kernel
                .spawn(name, priority::DEFAULT, move || {
                    for step in steps {
                        log.push(step);
                        kernel.yield_now();
                    }
                })
                .unwrap();
        }

        run_until_count(kernel, 1);
        assert_eq!(log.events(), ["a0", "b0", "a1", "b1", "a2", "b2"]);
        assert!(kernel.stats().context_switches >= 6);
    }

    #[test]
    fn test_thread_sees_itself_as_current() {
        let kernel = boot_kernel();
        let seen = EventLog::new();

        let recorder = seen.clone();
        let id = kernel
            .spawn("worker", 7, move || {
                assert_eq!(kernel.current_name().as_str(), "worker");
                assert_eq!(kernel.priority(), 7);
                assert_eq!(HostArch::interrupt_level(), InterruptLevel::On);
                recorder.push("ran");
            })
            .unwrap();

        assert_eq!(id.get(), 2);
        kernel.yield_now();
        assert_eq!(seen.events(), ["ran"]);
        assert_eq!(kernel.current_id().get(), 1);
    }

    #[test]
    fn test_plain_function_entry() {
        use portable_atomic::{AtomicUsize, Ordering};
        static SUM: AtomicUsize = AtomicUsize::new(0);

        fn add(n: usize) {
            SUM.fetch_add(n, Ordering::SeqCst);
        }

        let kernel = boot_kernel();
        kernel.create("add-3", priority::MAX, add, 3).unwrap();
        kernel.create("add-4", priority::MIN, add, 4).unwrap();
        run_until_count(kernel, 1);

        assert_eq!(SUM.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_exit_frees_page_after_switch() {
        let kernel = boot_kernel();
        let log = EventLog::new();

        let recorder = log.clone();
        kernel
            .spawn("short", priority::DEFAULT, move || {
                let pages = kernel.pages().stats();
                assert_eq!(pages.in_use, 1);
                assert_eq!(pages.freed, 0);
                recorder.push("done");
            })
            .unwrap();

        kernel.yield_now();

        let pages = kernel.pages().stats();
        assert_eq!(log.events(), ["done"]);
        assert_eq!(pages.freed, 1);
        assert_eq!(pages.in_use, 0);
        assert_eq!(kernel.pages().free_pages(), 1);
        assert_eq!(kernel.stats().threads_reaped, 1);
        assert_eq!(kernel.stats().threads_created, 1);
    }

    #[test]
    fn test_out_of_pages_is_an_error() {
        let kernel = boot_kernel_with(PagePool::with_limit(1));

        kernel.spawn("first", priority::DEFAULT, || {}).unwrap();
        assert_eq!(
            kernel.spawn("second", priority::DEFAULT, || {}),
            Err(SpawnError::OutOfMemory)
        );
        assert_eq!(HostArch::interrupt_level(), InterruptLevel::Off);
        assert_eq!(kernel.thread_count(), 2);
        assert_eq!(kernel.pages().stats().exhausted, 1);

        // the first thread's page comes back once it has exited
        run_until_count(kernel, 1);
        kernel.spawn("third", priority::DEFAULT, || {}).unwrap();
        run_until_count(kernel, 1);
        assert_eq!(kernel.stats().threads_reaped, 2);
    }

    #[test]
    fn test_for_each_lists_live_threads() {
        let kernel = boot_kernel();
        for name in ["a", "b", "c"] {
            kernel.spawn(name, priority::DEFAULT, || {}).unwrap();
        }

        let mut names = Vec::new();
        kernel.for_each(|t| names.push((t.name(), t.state())));
        let names: Vec<_> = names.iter().map(|(n, s)| (n.as_str(), *s)).collect();
        assert_eq!(
            names,
            [
                ("main", ThreadState::Running),
                ("a", ThreadState::Ready),
                ("b", ThreadState::Ready),
                ("c", ThreadState::Ready),
            ]
        );

        run_until_count(kernel, 1);
        let mut count = 0;
        kernel.for_each(|_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_set_priority_is_stored_only() {
        let kernel = boot_kernel();
        kernel.set_priority(priority::MAX);
        assert_eq!(kernel.priority(), priority::MAX);
        assert_eq!(kernel.current().priority(), priority::MAX);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let kernel = boot_kernel();
        let names = EventLog::new();
        let recorder = names.clone();
        kernel
            .spawn("a-very-long-thread-name-indeed", priority::DEFAULT, move || {
                assert_eq!(kernel.current_name().as_str(), "a-very-long-thread-n");
                recorder.push("checked");
            })
            .unwrap();
        kernel.yield_now();
        assert_eq!(names.events(), ["checked"]);
    }

    #[test]
    #[should_panic(expected = "block called with interrupts enabled")]
    fn test_block_with_interrupts_enabled_panics() {
        let kernel = boot_kernel();
        HostArch::enable_interrupts();
        kernel.block();
    }

    #[test]
    #[should_panic(expected = "is not blocked")]
    fn test_unblock_running_thread_panics() {
        let kernel = boot_kernel();
        kernel.unblock(kernel.current());
    }

    #[test]
    #[should_panic(expected = "priority 64 outside")]
    fn test_invalid_priority_panics() {
        let kernel = boot_kernel();
        let _ = kernel.spawn("bad", priority::MAX + 1, || {});
    }

    #[test]
    #[should_panic(expected = "outside its page")]
    fn test_corrupted_saved_stack_pointer_is_detected() {
        let kernel = boot_kernel();
        kernel.spawn("victim", priority::DEFAULT, || {}).unwrap();

        let mut victim = None;
        kernel.for_each(|t| {
            if t.name().as_str() == "victim" {
                victim = Some(t);
            }
        });
        let victim = victim.unwrap();
        unsafe { (*victim.context_ptr()).sp = (victim.page_base() + 2 * PAGE_SIZE) as u64 };

        kernel.yield_now();
    }

    #[test]
    #[should_panic(expected = "clobbered canary")]
    fn test_clobbered_canary_is_detected() {
        let kernel = boot_kernel();
        kernel.current().invalidate();
        kernel.current();
    }
}

#[cfg(test)]
mod sync_tests {
    use crate::sched::priority;
    use crate::tests::helpers::{boot_kernel, lock, run_until_count, semaphore, EventLog};

    #[test]
    fn test_semaphore_wakes_in_fifo_order() {
        let kernel = boot_kernel();
        let sema = semaphore(kernel, 0);
        let log = EventLog::new();

        for name in ["w1", "w2", "w3"] {
            let log = log.clone();
            kernel
                .spawn(name, priority::DEFAULT, move || {
                    sema.down();
                    log.push(name);
                })
                .unwrap();
        }

        kernel.yield_now();
        assert_eq!(sema.waiters(), 3);
        assert!(log.events().is_empty());

        for _ in 0..3 {
            sema.up();
        }
        assert_eq!(sema.waiters(), 0);
        assert_eq!(sema.value(), 3);

        run_until_count(kernel, 1);
        assert_eq!(log.events(), ["w1", "w2", "w3"]);
        assert_eq!(sema.value(), 0);
    }

    #[test]
    fn test_semaphore_counts_without_blocking() {
        let kernel = boot_kernel();
        let sema = semaphore(kernel, 2);

        sema.down();
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert_eq!(sema.value(), 1);
        assert_eq!(kernel.stats().context_switches, 0);
    }

    #[test]
    fn test_lock_hands_off_to_waiter() {
        let kernel = boot_kernel();
        let lock = lock(kernel);
        let log = EventLog::new();

        let a_log = log.clone();
        kernel
            .spawn("a", priority::DEFAULT, move || {
                lock.acquire();
                a_log.push("a-in");
                kernel.yield_now();
                a_log.push("a-out");
                lock.release();
            })
            .unwrap();

        let b_log = log.clone();
        kernel
            .spawn("b", priority::DEFAULT, move || {
                lock.acquire();
                assert!(lock.held_by_current_thread());
                b_log.push("b-in");
                lock.release();
            })
            .unwrap();

        run_until_count(kernel, 1);
        assert_eq!(log.events(), ["a-in", "a-out", "b-in"]);
        assert!(lock.holder().is_none());
    }

    #[test]
    fn test_try_acquire() {
        let kernel = boot_kernel();
        let lock = lock(kernel);

        assert!(lock.try_acquire());
        assert!(lock.held_by_current_thread());

        let log = EventLog::new();
        let recorder = log.clone();
        kernel
            .spawn("contender", priority::DEFAULT, move || {
                assert!(!lock.try_acquire());
                recorder.push("refused");
            })
            .unwrap();
        run_until_count(kernel, 1);

        assert_eq!(log.events(), ["refused"]);
        lock.release();
        assert!(lock.holder().is_none());
    }

    #[test]
    #[should_panic(expected = "already held by current thread")]
    fn test_reentrant_acquire_panics() {
        let kernel = boot_kernel();
        let lock = lock(kernel);
        lock.acquire();
        lock.acquire();
    }

    #[test]
    #[should_panic(expected = "does not hold the lock")]
    fn test_release_by_non_holder_panics() {
        let kernel = boot_kernel();
        let lock = lock(kernel);
        lock.release();
    }

    #[test]
    #[should_panic(expected = "does not hold the lock")]
    fn test_release_from_other_thread_panics() {
        let kernel = boot_kernel();
        let lock = lock(kernel);
        lock.acquire();
        kernel
            .spawn("thief", priority::DEFAULT, move || lock.release())
            .unwrap();
        kernel.yield_now();
    }
}
