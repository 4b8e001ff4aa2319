use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::Record;

use super::now_unix;

/// Transport-neutral resolver response. All three upstream variants decode
/// into this shape; the answerer and the cache only ever see this.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub status: ResponseCode,
    pub truncated: bool,
    pub recursion_available: bool,
    pub authentic_data: bool,
    pub checking_disabled: bool,
    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
    /// Wall-clock seconds when the upstream reply finished decoding.
    pub arrival_unix: i64,
}

impl DnsResponse {
    /// Captures a decoded upstream wire message, stamped with the current
    /// time.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            status: msg.response_code(),
            truncated: msg.truncated(),
            recursion_available: msg.recursion_available(),
            authentic_data: msg.authentic_data(),
            checking_disabled: msg.checking_disabled(),
            answer: msg.answers().to_vec(),
            authority: msg.name_servers().to_vec(),
            additional: msg.additionals().to_vec(),
            arrival_unix: now_unix(),
        }
    }

    /// Smallest TTL across answer and authority. Zero iff both are empty.
    pub fn min_ttl(&self) -> u32 {
        self.answer
            .iter()
            .chain(self.authority.iter())
            .map(Record::ttl)
            .min()
            .unwrap_or(0)
    }

    /// A copy with every record's TTL reduced by the seconds elapsed between
    /// arrival and `now`, clamped at zero. Zero-TTL records are kept; they
    /// are a valid do-not-cache hint for the client. The view is stamped as
    /// freshly arrived so downstream TTL adjustment does not subtract the
    /// same interval again.
    pub fn ttl_adjusted(&self, now: i64) -> Self {
        let elapsed = (now - self.arrival_unix).clamp(0, u32::MAX as i64) as u32;
        self.ttl_reduced(elapsed, now)
    }

    /// Like [`Self::ttl_adjusted`] with an explicit elapsed interval; the
    /// cache uses this with time-since-set rather than time-since-arrival.
    pub(crate) fn ttl_reduced(&self, elapsed: u32, now: i64) -> Self {
        let mut view = self.clone();
        for record in view
            .answer
            .iter_mut()
            .chain(view.authority.iter_mut())
            .chain(view.additional.iter_mut())
        {
            record.set_ttl(record.ttl().saturating_sub(elapsed));
        }
        view.arrival_unix = now;
        view
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, RData, Record};

    use super::*;

    pub fn a_record(name: &str, ttl: u32, ip: Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_str(name).unwrap(), ttl, RData::A(A(ip)))
    }

    pub fn aaaa_record(name: &str, ttl: u32, ip: Ipv6Addr) -> Record {
        Record::from_rdata(Name::from_str(name).unwrap(), ttl, RData::AAAA(AAAA(ip)))
    }

    pub fn answer_response(records: Vec<Record>) -> DnsResponse {
        DnsResponse {
            status: ResponseCode::NoError,
            truncated: false,
            recursion_available: true,
            authentic_data: false,
            checking_disabled: false,
            answer: records,
            authority: Vec::new(),
            additional: Vec::new(),
            arrival_unix: now_unix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn min_ttl_spans_answer_and_authority() {
        let mut rsp = answer_response(vec![
            a_record("a.example.com.", 300, "1.2.3.4".parse().unwrap()),
            a_record("b.example.com.", 120, "1.2.3.5".parse().unwrap()),
        ]);
        rsp.authority
            .push(a_record("ns.example.com.", 60, "1.2.3.6".parse().unwrap()));
        // additional records do not participate
        rsp.additional
            .push(a_record("x.example.com.", 5, "1.2.3.7".parse().unwrap()));
        assert_eq!(rsp.min_ttl(), 60);
    }

    #[test]
    fn min_ttl_is_zero_when_both_sets_empty() {
        let rsp = answer_response(Vec::new());
        assert_eq!(rsp.min_ttl(), 0);
    }

    #[test]
    fn ttl_adjusted_decrements_and_clamps() {
        let rsp = answer_response(vec![a_record(
            "example.com.",
            10,
            "1.2.3.4".parse().unwrap(),
        )]);
        let view = rsp.ttl_adjusted(rsp.arrival_unix + 4);
        assert_eq!(view.answer[0].ttl(), 6);
        // original untouched
        assert_eq!(rsp.answer[0].ttl(), 10);

        let expired = rsp.ttl_adjusted(rsp.arrival_unix + 99);
        assert_eq!(expired.answer[0].ttl(), 0);
        assert_eq!(expired.answer.len(), 1);
    }

    #[test]
    fn ttl_adjusted_restamps_arrival() {
        let rsp = answer_response(vec![a_record(
            "example.com.",
            300,
            "1.2.3.4".parse().unwrap(),
        )]);
        let now = rsp.arrival_unix + 100;
        let view = rsp.ttl_adjusted(now);
        assert_eq!(view.arrival_unix, now);
    }
}
