//! Integration tests exercising `mprompt` purely through its public API,
//! covering the scenarios the design notes call out explicitly: exception
//! unwinding across nested prompts with `FINALLY` ordering, multi-shot
//! resumption producing every choice, and `mask` hiding an outer handler.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use mprompt::effect::{handle, perform};
use mprompt::handler::{self, finally, mask, Kind};
use mprompt::Resume;

#[test]
fn exception_effect_unwinds_through_nested_prompts() {
    let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));
    let raise = Kind::new();

    let log2 = log.clone();
    let result = handle(
        raise,
        move |_resume: Resume, arg: Box<dyn Any>| {
            // The handler never resumes: raising this effect always ends
            // the enclosing prompt with the carried error value.
            arg
        },
        move |_: ()| -> i32 {
            let log3 = log2.clone();
            finally(
                move || log3.borrow_mut().push("outer finally"),
                move || -> i32 {
                    let log4 = log2.clone();
                    finally(move || log4.borrow_mut().push("inner finally"), move || {
                        let _: i32 = perform(raise, -1);
                        unreachable!("raise never resumes");
                    })
                },
            )
        },
        (),
    );

    assert_eq!(result, -1);
    assert_eq!(*log.borrow(), vec!["inner finally", "outer finally"]);
}

#[test]
fn multishot_resumption_explores_every_choice() {
    let choose = Kind::new();

    let results = Rc::new(RefCell::new(Vec::<i32>::new()));
    let results2 = results.clone();

    handle(
        choose,
        move |resume: Resume, arg: Box<dyn Any>| -> Box<dyn Any> {
            let options = *arg.downcast::<Vec<i32>>().unwrap();
            // Freeze the suspension point once, then drive it forward once
            // per option — each call restores the same pristine gstack
            // snapshot rather than consuming it.
            let multi = resume.into_multi();
            let mut last = Box::new(()) as Box<dyn Any>;
            for opt in options {
                last = multi.resume(Box::new(opt));
            }
            last
        },
        move |_: ()| {
            let n: i32 = perform(choose, vec![1, 2]);
            results2.borrow_mut().push(n);
        },
        (),
    );

    let mut seen = results.borrow().clone();
    seen.sort();
    assert_eq!(seen, vec![1, 2]);
}

#[test]
fn mask_hides_the_outer_handler_of_the_same_kind() {
    let kind = Kind::new();
    handler::linear_handler(
        kind,
        std::ptr::null_mut(),
        |_, _| {
            let outer = handler::top();
            handler::linear_handler(kind, std::ptr::null_mut(), |_, _| {
                let seen = mask(kind, 0, |_| handler::find(kind), 0);
                assert_eq!(seen.map(handler::id), outer.map(handler::id));
            }, 0);
        },
        0,
    );
}
