//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build subsystems from adapters → Start them
//!
//! Serve (app.rs):
//!     Launch transports → Announce to discovery → Up → Ready → block
//!
//! Shutdown (shutdown.rs):
//!     Leave discovery → Drain hooks → transports → scheduler → stream
//!         → pubsub → background tasks → Down
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//!     SIGQUIT → immediate close
//!     anything else trapped → exit 128 + n
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core collaborators, then messaging
//! - Ordered shutdown: traffic sources before the work they feed
//! - Adapters come from an explicit registry, never global state

pub mod adapters;
pub mod app;
mod heartbeat;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use adapters::{AdapterError, Adapters};
pub use app::{App, ServeError, ServiceRegistration};
pub use startup::StartError;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bg::Job;
    use crate::config::ConfigTree;
    use crate::context::Ctx;
    use crate::disco::{Agent, DiscoError, LocalAgent, Registration, ServiceHandle};
    use crate::net::http::HttpServer;
    use crate::net::pubsub::{self, PubSub, PubSubError};
    use crate::net::stream::{self, Stream, StreamError, Subscription, SubscriptionOption};
    use crate::net::{NetError, Server, State};
    use crate::schedule::{JobHandler, JobId, ScheduleError, Scheduler};

    async fn app() -> App {
        let tree = ConfigTree::parse("trap_signals = false\nheartbeat_secs = 0\n").unwrap();
        App::start("test", tree, &Adapters::with_defaults()).await.unwrap()
    }

    #[tokio::test]
    async fn drain_is_false_when_not_up() {
        let app = app().await;
        assert!(!app.drain().await);
        assert!(!app.shutdown().await);
        assert_eq!(app.state(), State::Down);
    }

    #[tokio::test]
    async fn drain_runs_hooks_once_in_order() {
        let app = app().await;
        app.register_server("127.0.0.1:0", Arc::new(HttpServer::default()));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            app.register_drain_hook(move |_| {
                let order = order.clone();
                async move { order.lock().unwrap().push(n) }
            });
        }

        let serving = tokio::spawn({
            let app = app.clone();
            async move { app.serve().await }
        });
        app.ready().await;
        assert_eq!(app.state(), State::Up);

        assert!(app.drain().await);
        assert!(!app.drain().await);
        serving.await.unwrap().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(app.state(), State::Down);
    }

    #[tokio::test]
    async fn ready_releases_every_waiter() {
        let app = app().await;
        app.register_server("127.0.0.1:0", Arc::new(HttpServer::default()));
        let released = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let app = app.clone();
                let released = released.clone();
                tokio::spawn(async move {
                    app.ready().await;
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let serving = tokio::spawn({
            let app = app.clone();
            async move { app.serve().await }
        });
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("waiter released")
                .unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 4);

        // Late callers return at once.
        tokio::time::timeout(Duration::from_millis(100), app.ready())
            .await
            .expect("gate stays open");

        assert!(app.shutdown().await);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serve_without_transports_fails() {
        let app = app().await;
        let err = app.serve().await.unwrap_err();
        assert!(matches!(err, ServeError::Transport(crate::net::NetError::EmptyRegistry)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let app = app().await;
        app.close().await;
        app.close().await;
        assert!(app.ctx().error().is_some());
        tokio::time::timeout(Duration::from_millis(100), app.stopped())
            .await
            .expect("stopped after close");
    }

    #[tokio::test]
    async fn unknown_adapter_fails_startup() {
        let tree = ConfigTree::parse("[schedule.cron]\n").unwrap();
        let err = App::start("test", tree, &Adapters::with_defaults()).await.unwrap_err();
        assert!(matches!(err, StartError::Adapter(AdapterError::NotFound { .. })));
    }

    #[tokio::test]
    async fn invalid_config_fails_startup() {
        let tree = ConfigTree::parse("node = \"\"\n").unwrap();
        let err = App::start("test", tree, &Adapters::with_defaults()).await.unwrap_err();
        assert!(matches!(err, StartError::Config(crate::config::ConfigError::Validation(_))));
    }

    type Log = Arc<std::sync::Mutex<Vec<&'static str>>>;

    fn record(log: &Log, event: &'static str) {
        log.lock().unwrap().push(event);
    }

    struct RecScheduler(Log);

    #[async_trait]
    impl Scheduler for RecScheduler {
        fn handle_func(&self, _: &str, _: JobHandler) {}

        fn in_(&self, _: &Ctx, _: Duration, _: &str, _: Vec<u8>) -> Result<JobId, ScheduleError> {
            Ok(JobId::new())
        }

        async fn start(&self, _: &Ctx) -> Result<(), ScheduleError> {
            Ok(())
        }

        async fn drain(&self) {
            record(&self.0, "scheduler.drain");
        }

        async fn close(&self) -> Result<(), ScheduleError> {
            record(&self.0, "scheduler.close");
            Ok(())
        }
    }

    struct RecPubSub {
        log: Log,
        fail_start: bool,
    }

    #[async_trait]
    impl PubSub for RecPubSub {
        async fn start(&self, _: &Ctx) -> Result<(), PubSubError> {
            if self.fail_start {
                return Err(PubSubError::Draining);
            }
            Ok(())
        }

        async fn publish(&self, _: &Ctx, _: &str, _: Vec<u8>) -> Result<(), PubSubError> {
            Ok(())
        }

        fn subscribe(&self, _: &str, _: &str, _: pubsub::MsgHandler) -> Result<(), PubSubError> {
            Ok(())
        }

        async fn drain(&self) {
            record(&self.log, "pubsub.drain");
        }

        async fn close(&self) -> Result<(), PubSubError> {
            record(&self.log, "pubsub.close");
            Ok(())
        }
    }

    struct RecStream(Log);

    #[async_trait]
    impl Stream for RecStream {
        async fn start(&self, _: &Ctx) -> Result<(), StreamError> {
            Ok(())
        }

        async fn publish(&self, _: &Ctx, _: &str, _: Vec<u8>) -> Result<(), StreamError> {
            Ok(())
        }

        fn subscribe(
            &self,
            _: &str,
            _: &str,
            _: stream::MsgHandler,
            _: &[SubscriptionOption],
        ) -> Result<Subscription, StreamError> {
            Ok(Subscription::detached())
        }

        async fn drain(&self) {
            record(&self.0, "stream.drain");
        }

        async fn close(&self) -> Result<(), StreamError> {
            record(&self.0, "stream.close");
            Ok(())
        }
    }

    struct RecServer {
        log: Log,
        stop: CancellationToken,
    }

    impl RecServer {
        fn new(log: &Log) -> Arc<Self> {
            Arc::new(Self {
                log: log.clone(),
                stop: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl Server for RecServer {
        async fn serve(&self, ctx: Ctx, _: String) -> Result<(), NetError> {
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = ctx.cancellation_token().cancelled() => {}
            }
            Ok(())
        }

        async fn drain(&self) {
            record(&self.log, "transports.drain");
            self.stop.cancel();
        }
    }

    struct RecJob {
        log: Log,
        stop: CancellationToken,
    }

    #[async_trait]
    impl Job for RecJob {
        async fn start(&self, _: Ctx) {
            self.stop.cancelled().await;
        }

        fn stop(&self) {
            record(&self.log, "tasks.stop");
            self.stop.cancel();
        }
    }

    /// Agent whose registrations always fail.
    struct UnreachableAgent(LocalAgent);

    #[async_trait]
    impl Agent for UnreachableAgent {
        async fn register(&self, _: &Ctx, _: Registration) -> Result<String, DiscoError> {
            Err(DiscoError::Unavailable("down".into()))
        }

        async fn deregister(&self, _: &Ctx, _: &str) -> Result<(), DiscoError> {
            Ok(())
        }

        async fn leave(&self, _: &Ctx) {}

        fn service(&self, name: &str, tags: &[String]) -> Result<ServiceHandle, DiscoError> {
            self.0.service(name, tags)
        }
    }

    fn recording_adapters(log: &Log, fail_pubsub: bool) -> Adapters {
        let mut adapters = Adapters::with_defaults();
        let scheduler = log.clone();
        adapters.register_scheduler("rec", move |_| Ok(Arc::new(RecScheduler(scheduler.clone()))));
        let pubsub = log.clone();
        adapters.register_pubsub("rec", move |_| {
            Ok(Arc::new(RecPubSub {
                log: pubsub.clone(),
                fail_start: fail_pubsub,
            }))
        });
        let stream = log.clone();
        adapters.register_stream("rec", move |_| Ok(Arc::new(RecStream(stream.clone()))));
        adapters.register_disco("unreachable", |_| Ok(Arc::new(UnreachableAgent(LocalAgent::new()))));
        adapters
    }

    const RECORDED: &str = "trap_signals = false\nheartbeat_secs = 0\n\
        [schedule.rec]\n[net.pubsub.rec]\n[net.stream.rec]\n";

    #[tokio::test]
    async fn drain_order_follows_traffic_flow() {
        let log = Log::default();
        let tree = ConfigTree::parse(RECORDED).unwrap();
        let app = App::start("test", tree, &recording_adapters(&log, false)).await.unwrap();
        app.register_server("127.0.0.1:0", RecServer::new(&log));

        // Nothing is drained before the app is up.
        assert!(!app.drain().await);
        assert!(!app.shutdown().await);
        assert!(log.lock().unwrap().is_empty());

        let serving = tokio::spawn({
            let app = app.clone();
            async move { app.serve().await }
        });
        app.ready().await;
        app.ctx()
            .tasks()
            .dispatch_job(
                app.ctx(),
                Arc::new(RecJob {
                    log: log.clone(),
                    stop: CancellationToken::new(),
                }),
            )
            .unwrap();

        assert!(app.drain().await);
        serving.await.unwrap().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "transports.drain",
                "scheduler.drain",
                "stream.drain",
                "pubsub.drain",
                "tasks.stop",
            ]
        );
    }

    #[tokio::test]
    async fn failed_startup_closes_started_subsystems() {
        let log = Log::default();
        let tree = ConfigTree::parse(RECORDED).unwrap();
        let err = App::start("test", tree, &recording_adapters(&log, true)).await.unwrap_err();

        assert!(matches!(err, StartError::Subsystem { subsystem: "net.pubsub", .. }));
        let log = log.lock().unwrap();
        assert!(log.contains(&"scheduler.close"));
        assert!(log.contains(&"pubsub.close"));
        assert!(!log.iter().any(|event| event.ends_with(".drain")));
    }

    #[tokio::test]
    async fn failed_registration_stops_transports() {
        let log = Log::default();
        let tree = ConfigTree::parse(
            "trap_signals = false\nheartbeat_secs = 0\n[disco.unreachable]\n",
        )
        .unwrap();
        let app = App::start("test", tree, &recording_adapters(&log, false)).await.unwrap();
        app.register_service(ServiceRegistration {
            name: "orders".into(),
            host: "127.0.0.1".into(),
            port: 0,
            server: RecServer::new(&log),
            tags: Vec::new(),
        });

        let err = tokio::time::timeout(Duration::from_secs(2), app.serve())
            .await
            .expect("serve returns once registration fails")
            .unwrap_err();

        assert!(matches!(err, ServeError::Registration(DiscoError::Unavailable(_))));
        assert_eq!(*log.lock().unwrap(), vec!["transports.drain"]);
        assert_eq!(app.state(), State::Down);
    }
}
