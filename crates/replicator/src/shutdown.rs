use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    /// First Ctrl-C: stop leasing new cycles, let in-flight work finish.
    Graceful,
    /// Second Ctrl-C: give up waiting.
    Immediate,
}

/// Listens for Ctrl-C and translates repeated presses into escalating
/// shutdown events.
pub fn spawn_signal_listener() -> mpsc::UnboundedReceiver<ShutdownEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut interrupts = 0u8;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupts += 1;
            let event = if interrupts == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if tx.send(event).is_err() || interrupts > 1 {
                return;
            }
        }
    });
    rx
}
