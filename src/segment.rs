//! Named customer segments and the ordered rules that assign them

use std::fmt;

use serde::{Serialize, Serializer};

/// Customer segment derived from R, F and M scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Champions,
    LoyalCustomers,
    NewCustomers,
    CantLoseThem,
    AtRisk,
    LostCustomers,
    FrequentBuyers,
    BigSpenders,
    Others,
}

impl Segment {
    /// Every segment, in rule order.
    pub const ALL: [Segment; 9] = [
        Segment::Champions,
        Segment::LoyalCustomers,
        Segment::NewCustomers,
        Segment::CantLoseThem,
        Segment::AtRisk,
        Segment::LostCustomers,
        Segment::FrequentBuyers,
        Segment::BigSpenders,
        Segment::Others,
    ];

    /// Assign a segment from recency, frequency and monetary scores.
    ///
    /// Rules are evaluated top to bottom and the first match wins. Some
    /// later rules are shadowed by earlier ones (`LostCustomers` can never
    /// match after `AtRisk`); the order itself defines the segments.
    pub fn classify(r: u8, f: u8, m: u8) -> Segment {
        if r == 5 && f == 5 {
            Segment::Champions
        } else if r >= 4 && f >= 4 {
            Segment::LoyalCustomers
        } else if r == 5 && f <= 3 {
            Segment::NewCustomers
        } else if r <= 2 && f >= 4 {
            Segment::CantLoseThem
        } else if r <= 2 && f <= 3 {
            Segment::AtRisk
        } else if r == 1 && f <= 2 {
            Segment::LostCustomers
        } else if f >= 4 {
            Segment::FrequentBuyers
        } else if m >= 4 {
            Segment::BigSpenders
        } else {
            Segment::Others
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Segment::Champions => "Champions",
            Segment::LoyalCustomers => "Loyal Customers",
            Segment::NewCustomers => "New Customers",
            Segment::CantLoseThem => "Can't Lose Them",
            Segment::AtRisk => "At Risk",
            Segment::LostCustomers => "Lost Customers",
            Segment::FrequentBuyers => "Frequent Buyers",
            Segment::BigSpenders => "Big Spenders",
            Segment::Others => "Others",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}
