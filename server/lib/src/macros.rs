/// Build an [`Entry`](crate::entry::Entry) from a DN and a list of
/// `(attribute, value)` pairs. Values of `objectClass` become object classes,
/// everything else is placed in the user attribute map.
#[cfg(test)]
macro_rules! entry_init {
    ($dn:expr) => {{
        $crate::entry::Entry::new($crate::dn::Dn::parse($dn).expect("invalid test dn"))
    }};
    ($dn:expr, $( ($attr:expr, $value:expr) ),+ $(,)?) => {{
        let mut e = $crate::entry::Entry::new(
            $crate::dn::Dn::parse($dn).expect("invalid test dn"),
        );
        $(
            e.add_values($attr, false, [$value]);
        )+
        e
    }};
}

/// Assert an operation finished with the expected result code, printing its
/// diagnostic when it did not.
#[cfg(test)]
macro_rules! assert_result {
    ($result:expr, $code:expr) => {{
        let r = &$result;
        assert_eq!(
            r.code, $code,
            "unexpected result {:?}, diagnostic: {:?}",
            r.code, r.diagnostic
        );
    }};
}
