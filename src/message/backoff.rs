use std::time::Duration;

/// An endless sequence of retry delays which grows by a constant factor
/// until it saturates at a maximum delay.
///
pub struct ExponentialBackoff {
    next: Duration,
    max: Duration,
    factor: u32,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32) -> Self {
        Self {
            next: start.min(max),
            max,
            factor,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let this = self.next;
        self.next = (self.next * self.factor).min(self.max);
        Some(this)
    }
}

/// Attempt `f` once per delay yielded by `delays`, sleeping for that delay
/// after each failure, until it succeeds. The `on_err` closure sees every
/// failure. If the delays run out, the last error is returned.
///
pub fn retry<I, F, T, E, S>(delays: I, mut f: F, on_err: S) -> Result<T, E>
where
    I: IntoIterator<Item = Duration>,
    F: FnMut() -> Result<T, E>,
    S: Fn(&E, Duration),
{
    let mut delays = delays.into_iter().peekable();

    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => match delays.next() {
                Some(delay) if delays.peek().is_some() => {
                    on_err(&e, delay);
                    std::thread::sleep(delay);
                }
                _ => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod test {

    use std::time::Duration;
    use super::{retry, ExponentialBackoff};

    #[test]
    fn delays_grow_then_saturate() {
        let delays: Vec<_> = ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            2,
        )
        .take(5)
        .map(|d| d.as_millis())
        .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn retry_gives_up_with_the_last_error() {
        let mut attempts = 0;
        let delays = ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, 2).take(3);
        let result: Result<(), usize> = retry(delays, || { attempts += 1; Err(attempts) }, |_, _| {});
        assert_eq!(result, Err(3));
    }

    #[test]
    fn retry_returns_the_first_success() {
        let mut attempts = 0;
        let delays = ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, 2);
        let result: Result<usize, ()> = retry(delays, || {
            attempts += 1;
            if attempts == 4 { Ok(attempts) } else { Err(()) }
        }, |_, _| {});
        assert_eq!(result, Ok(4));
    }
}
