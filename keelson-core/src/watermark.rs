//! Watermark sanitizers and predicates shared by the socket queues.
//!
//! Outgoing queues measure drain: the low watermark is satisfied once the
//! queue has emptied down to it. Incoming queues measure fill: the low
//! watermark is satisfied once the queue holds at least that much.

/// Force `low <= high` after either threshold of an outgoing queue is set.
pub fn sanitize_outgoing(low: &mut usize, high: &mut usize) {
    *high = (*high).max(*low);
    *low = (*low).min(*high);
}

/// Force `low <= high` after either threshold of an incoming queue is set.
pub fn sanitize_incoming(low: &mut usize, high: &mut usize) {
    *high = (*high).max(*low);
    *low = (*low).min(*high);
}

/// True once an outgoing queue has drained down to its low watermark.
#[inline]
#[must_use]
pub const fn outgoing_low_satisfied(size: usize, low: usize) -> bool {
    size <= low
}

/// True once an outgoing queue has filled up to its high watermark.
#[inline]
#[must_use]
pub const fn outgoing_high_violated(size: usize, high: usize) -> bool {
    size >= high
}

/// True once an incoming queue has filled to at least its low watermark.
#[inline]
#[must_use]
pub const fn incoming_low_satisfied(size: usize, low: usize) -> bool {
    size >= low
}

/// True once an incoming queue has filled past its high watermark.
#[inline]
#[must_use]
pub const fn incoming_high_violated(size: usize, high: usize) -> bool {
    size > high
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_raises_high_to_low() {
        let mut low = 100;
        let mut high = 10;
        sanitize_outgoing(&mut low, &mut high);
        assert_eq!((low, high), (100, 100));
    }

    #[test]
    fn sanitize_keeps_valid_pairs() {
        let mut low = 10;
        let mut high = 100;
        sanitize_incoming(&mut low, &mut high);
        assert_eq!((low, high), (10, 100));
    }

    #[test]
    fn outgoing_predicates() {
        assert!(outgoing_low_satisfied(3, 3));
        assert!(!outgoing_low_satisfied(4, 3));
        assert!(outgoing_high_violated(8, 8));
        assert!(!outgoing_high_violated(7, 8));
    }

    #[test]
    fn incoming_predicates() {
        assert!(incoming_low_satisfied(3, 3));
        assert!(!incoming_low_satisfied(2, 3));
        assert!(incoming_high_violated(9, 8));
        assert!(!incoming_high_violated(8, 8));
    }
}
